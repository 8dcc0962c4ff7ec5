//! The per-domain research loop.
//!
//! Domains run one at a time in ascending id order. After each domain the
//! session is checkpointed, so an interrupted run loses at most the domain in
//! flight. A domain that fails is recorded as `failed` and the loop moves on,
//! unless strict mode is on, in which case the run stops at the first failure.

use std::ops::RangeInclusive;
use std::sync::Arc;

use tracing::{error, info, instrument, warn};

use dossier_shared::{
    DomainRecord, DomainStatus, DossierError, QualitySummary, Result, Session, SessionStatus,
};

use crate::domains::{DomainConfig, DomainRegistry, RunEstimate};
use crate::research::{DomainResearch, DomainTask, ResearchStrategy};
use crate::session::SessionManager;
use crate::validator::{OutputValidator, ValidationReport};

// ---------------------------------------------------------------------------
// Progress reporting
// ---------------------------------------------------------------------------

/// Progress callback for reporting run status.
pub trait ProgressReporter: Send + Sync {
    /// Called once before the first domain.
    fn run_started(&self, session: &Session, domains: &RangeInclusive<u32>);
    /// Called when a domain begins.
    fn domain_started(&self, domain_id: u32, name: &str);
    /// Called when a domain is recorded as completed (possibly with gaps).
    fn domain_completed(&self, record: &DomainRecord);
    /// Called when a domain is recorded as failed.
    fn domain_failed(&self, domain_id: u32, name: &str, reason: &str);
    /// Called when the run finishes.
    fn done(&self, session: &Session);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn run_started(&self, _session: &Session, _domains: &RangeInclusive<u32>) {}
    fn domain_started(&self, _domain_id: u32, _name: &str) {}
    fn domain_completed(&self, _record: &DomainRecord) {}
    fn domain_failed(&self, _domain_id: u32, _name: &str, _reason: &str) {}
    fn done(&self, _session: &Session) {}
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Runs domains against a research strategy and checkpoints the session.
pub struct Orchestrator {
    registry: Arc<DomainRegistry>,
    sessions: SessionManager,
    strategy: Box<dyn ResearchStrategy>,
    validator: OutputValidator,
    strict_mode: bool,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<DomainRegistry>,
        sessions: SessionManager,
        strategy: Box<dyn ResearchStrategy>,
        validator: OutputValidator,
        strict_mode: bool,
    ) -> Self {
        Self {
            registry,
            sessions,
            strategy,
            validator,
            strict_mode,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn registry(&self) -> &DomainRegistry {
        &self.registry
    }

    /// Domain and query counts for a range.
    pub fn estimate(&self, domains: RangeInclusive<u32>) -> Result<RunEstimate> {
        self.registry.estimate(domains)
    }

    /// Continue the stored session from its resume point to the last domain.
    pub async fn resume(
        &self,
        subject: &str,
        target: &str,
        locality: Option<&str>,
        progress: &dyn ProgressReporter,
    ) -> Result<Session> {
        let session = self.sessions.load_or_create(subject, target);
        let start = self.sessions.get_resume_point(&session);
        if start > self.registry.len() {
            info!(session_id = %session.session_id, "all domains already complete");
            return Ok(session);
        }
        self.run(subject, target, start..=self.registry.len(), locality, progress)
            .await
    }

    /// Research every domain in `domains` (inclusive, ascending) for
    /// `(subject, target)`, checkpointing after each one.
    #[instrument(skip_all, fields(subject = %subject, target = %target, start = *domains.start(), end = *domains.end()))]
    pub async fn run(
        &self,
        subject: &str,
        target: &str,
        domains: RangeInclusive<u32>,
        locality: Option<&str>,
        progress: &dyn ProgressReporter,
    ) -> Result<Session> {
        self.registry.check_range(&domains)?;

        let mut session = self.sessions.load_or_create(subject, target);
        info!(
            session_id = %session.session_id,
            mode = self.strategy.mode().as_str(),
            strict = self.strict_mode,
            "starting research run"
        );
        progress.run_started(&session, &domains);

        for id in domains {
            let domain = self.registry.require(id)?;
            progress.domain_started(id, &domain.name);
            self.run_domain(&mut session, domain, subject, target, locality, progress)
                .await?;
        }

        session.overall_status = SessionStatus::Completed;
        self.sessions.save(&mut session)?;
        info!(
            session_id = %session.session_id,
            completeness = session.completeness_score,
            cost_usd = session.total_cost_usd,
            "research run finished"
        );
        progress.done(&session);
        Ok(session)
    }

    async fn run_domain(
        &self,
        session: &mut Session,
        domain: &DomainConfig,
        subject: &str,
        target: &str,
        locality: Option<&str>,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        let started_at = self.sessions.now();
        let mut in_flight = session
            .get_domain(domain.id)
            .cloned()
            .unwrap_or_else(|| DomainRecord::new(domain.id, &domain.name));
        in_flight.status = DomainStatus::InProgress;
        in_flight.started_at = Some(started_at);
        in_flight.completed_at = None;

        let task = DomainTask {
            domain,
            subject,
            target,
            locality,
            prompt: self.registry.prompt_for(domain, subject, target),
        };

        let research = match self.strategy.research(&task).await {
            Ok(research) => research,
            Err(e) => return self.record_error(session, domain, in_flight, e, progress),
        };

        let report = self.validator.validate(
            &research.parse_result,
            &domain.required_tables,
            Some(&domain.critical_fields),
        );
        let parsed = research.parse_result.success;
        let mut record = self.build_record(domain, started_at, research, &report);

        if !report.is_ok() && self.strict_mode {
            record.status = DomainStatus::Failed;
            let reason = report.issues.join("; ");
            progress.domain_failed(domain.id, &domain.name, &reason);
            session.set_domain(record);
            self.sessions.save(session)?;
            error!(domain = domain.id, issues = ?report.issues, "validation failed in strict mode");
            return Err(DossierError::validation(format!(
                "domain {} validation failed: {reason}",
                domain.id
            )));
        }

        if !parsed {
            record.status = DomainStatus::Failed;
            warn!(domain = domain.id, "model output could not be parsed");
            progress.domain_failed(domain.id, &domain.name, "model output could not be parsed");
            session.set_domain(record);
            self.sessions.save(session)?;
            return Ok(());
        }

        record.status = DomainStatus::Completed;
        record.completed_at = Some(self.sessions.now());
        if !report.is_ok() {
            warn!(domain = domain.id, gaps = report.issues.len(), "domain completed with gaps");
        }
        progress.domain_completed(&record);
        session.set_domain(record);
        session.current_domain = domain.id + 1;
        self.sessions.save(session)?;
        info!(domain = domain.id, "checkpoint saved");
        Ok(())
    }

    /// Record an unexpected research error. Strict mode stops the run.
    fn record_error(
        &self,
        session: &mut Session,
        domain: &DomainConfig,
        in_flight: DomainRecord,
        err: DossierError,
        progress: &dyn ProgressReporter,
    ) -> Result<()> {
        error!(domain = domain.id, error = %err, "domain failed");
        progress.domain_failed(domain.id, &domain.name, &err.to_string());

        let record = match session.get_domain(domain.id) {
            Some(existing) => DomainRecord {
                status: DomainStatus::Failed,
                ..existing.clone()
            },
            None => {
                let mut minimal = DomainRecord::new(domain.id, &domain.name);
                minimal.status = DomainStatus::Failed;
                minimal.started_at = in_flight.started_at;
                minimal.quality_summary.validation_gaps = vec![format!("Error: {err}")];
                minimal
            }
        };
        session.set_domain(record);
        self.sessions.save(session)?;

        if self.strict_mode { Err(err) } else { Ok(()) }
    }

    fn build_record(
        &self,
        domain: &DomainConfig,
        started_at: chrono::DateTime<chrono::Utc>,
        research: DomainResearch,
        report: &ValidationReport,
    ) -> DomainRecord {
        let DomainResearch {
            parse_result,
            search_log,
            searches_completed,
            usage,
            estimated_cost_usd,
            ..
        } = research;

        let tables: Vec<_> = parse_result.tables().values().cloned().collect();
        let reported = parse_result
            .payload
            .as_ref()
            .map(|p| p.quality_summary.clone())
            .unwrap_or_default();

        let mut gaps = report.issues.clone();
        for gap in parse_result.data_gaps() {
            if !gaps.contains(gap) {
                gaps.push(gap.clone());
            }
        }

        let defaults = QualitySummary::default();
        let quality_summary = QualitySummary {
            searches_completed,
            tables_populated: tables
                .iter()
                .filter(|t| t.is_populated(self.validator.min_rows()))
                .count(),
            confidence_level: reported.confidence_level.unwrap_or(defaults.confidence_level),
            primary_source_quality: reported
                .primary_source_quality
                .unwrap_or(defaults.primary_source_quality),
            data_recency: reported.data_recency.unwrap_or(defaults.data_recency),
            validation_gaps: gaps,
            parse_method: Some(parse_result.parse_method),
        };

        DomainRecord {
            domain_id: domain.id,
            domain_name: domain.name.clone(),
            status: DomainStatus::InProgress,
            search_log,
            tables,
            raw_synthesis_output: Some(parse_result.raw_output),
            quality_summary,
            started_at: Some(started_at),
            completed_at: None,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            estimated_cost_usd,
        }
    }
}
