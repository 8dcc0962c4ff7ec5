//! Session lifecycle on top of an injected [`SessionStore`].

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use dossier_shared::{Clock, DomainStatus, Result, Session, SessionStatus, session_slug};
use dossier_storage::SessionStore;

/// A one-line view of a session for `status` and `list`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub subject: String,
    pub target: String,
    pub current_domain: u32,
    pub total_domains: u32,
    pub overall_status: SessionStatus,
    pub completeness_score: f64,
    pub domains_completed: usize,
    pub total_cost_usd: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.session_id.clone(),
            subject: s.subject.clone(),
            target: s.target.clone(),
            current_domain: s.current_domain,
            total_domains: s.total_domains,
            overall_status: s.overall_status,
            completeness_score: s.completeness_score,
            domains_completed: s.completed_domains(),
            total_cost_usd: s.total_cost_usd,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

/// Loads, creates and checkpoints sessions.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    total_domains: u32,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, total_domains: u32) -> Self {
        Self {
            store,
            clock,
            total_domains,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn total_domains(&self) -> u32 {
        self.total_domains
    }

    /// Resume the stored session for `(subject, target)` or start a fresh one.
    /// An unreadable checkpoint is logged and replaced by a fresh session on
    /// the next save.
    pub fn load_or_create(&self, subject: &str, target: &str) -> Session {
        let session_id = session_slug(subject, target);

        match self.store.load(&session_id) {
            Ok(Some(mut session)) => {
                info!(
                    %session_id,
                    current_domain = session.current_domain,
                    completed = session.completed_domains(),
                    "resuming session"
                );
                if session.total_domains != self.total_domains {
                    debug!(
                        stored = session.total_domains,
                        configured = self.total_domains,
                        "domain count changed since last run"
                    );
                    session.total_domains = self.total_domains;
                }
                return session;
            }
            Ok(None) => {}
            Err(e) => warn!(%session_id, error = %e, "could not load session, starting fresh"),
        }

        info!(%session_id, "creating new session");
        Session::new(subject, target, self.total_domains, self.now())
    }

    /// Stamp `updated_at`, recompute derived fields and persist.
    pub fn save(&self, session: &mut Session) -> Result<()> {
        session.updated_at = self.now();
        session.refresh_derived();
        self.store.save(session)
    }

    /// Lowest domain id that still needs work, or `N + 1` when all are complete.
    pub fn get_resume_point(&self, session: &Session) -> u32 {
        (1..=self.total_domains)
            .find(|id| {
                session
                    .get_domain(*id)
                    .is_none_or(|d| d.status != DomainStatus::Completed)
            })
            .unwrap_or(self.total_domains + 1)
    }

    /// Summary of the stored session, if any.
    pub fn status(&self, subject: &str, target: &str) -> Result<Option<SessionSummary>> {
        let session_id = session_slug(subject, target);
        Ok(self.store.load(&session_id)?.as_ref().map(SessionSummary::from))
    }

    pub fn delete(&self, subject: &str, target: &str) -> Result<bool> {
        self.store.delete(&session_slug(subject, target))
    }

    /// Copy the stored checkpoint aside under a timestamped name.
    pub fn backup(&self, subject: &str, target: &str) -> Result<Option<String>> {
        self.store.backup(&session_slug(subject, target), self.now())
    }

    /// All stored sessions, most recently updated first.
    pub fn list_sessions(&self) -> Result<Vec<SessionSummary>> {
        let mut summaries: Vec<SessionSummary> =
            self.store.list()?.iter().map(SessionSummary::from).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(summaries)
    }
}
