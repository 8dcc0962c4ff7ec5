//! Session persistence.
//!
//! [`FileSessionStore`] keeps one pretty-printed `<slug>_session.json` per
//! session. Writers hold an exclusive advisory lock on a sidecar
//! `<slug>_session.lock` file and replace the session file via tmp file +
//! fsync + rename; readers hold a shared lock on the same sidecar. A reader
//! therefore never sees a half-written file.
//!
//! [`MemorySessionStore`] is the in-process equivalent used by tests.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use dossier_shared::{DossierError, Result, Session};
use fs2::FileExt;
use tracing::{debug, info, warn};

const SESSION_SUFFIX: &str = "_session.json";

/// Storage handle for session checkpoints.
pub trait SessionStore: Send + Sync {
    /// Load a session. `Ok(None)` when absent; an error when unreadable or undecodable.
    fn load(&self, session_id: &str) -> Result<Option<Session>>;

    /// Persist a session, replacing any previous checkpoint.
    fn save(&self, session: &Session) -> Result<()>;

    /// Remove a session. Returns whether anything was removed.
    fn delete(&self, session_id: &str) -> Result<bool>;

    /// Copy the current checkpoint aside. Returns a description of where it went.
    fn backup(&self, session_id: &str, at: DateTime<Utc>) -> Result<Option<String>>;

    /// All decodable sessions, in no particular order.
    fn list(&self) -> Result<Vec<Session>>;
}

// ---------------------------------------------------------------------------
// FileSessionStore
// ---------------------------------------------------------------------------

/// Directory-backed store with advisory file locks.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the checkpoint file for a session id.
    pub fn session_path(&self, session_id: &str) -> PathBuf {
        self.dir.join(format!("{session_id}{SESSION_SUFFIX}"))
    }

    fn ensure_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| {
            DossierError::Persistence(format!("cannot create {}: {e}", self.dir.display()))
        })
    }

    fn read_session(path: &Path) -> Result<Session> {
        let content = fs::read_to_string(path).map_err(|e| DossierError::io(path, e))?;
        serde_json::from_str(&content)
            .map_err(|e| DossierError::parse(format!("{}: {e}", path.display())))
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self, session_id: &str) -> Result<Option<Session>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let _lock = FileLock::shared(&path)?;
        Self::read_session(&path).map(Some)
    }

    fn save(&self, session: &Session) -> Result<()> {
        self.ensure_dir()?;
        let path = self.session_path(&session.session_id);
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| DossierError::Persistence(format!("encode session: {e}")))?;

        let _lock = FileLock::exclusive(&path)?;
        write_atomic(&path, json.as_bytes()).map_err(|e| {
            DossierError::Persistence(format!("write {}: {e}", path.display()))
        })?;

        debug!(session_id = %session.session_id, path = %path.display(), "saved session");
        Ok(())
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(false);
        }
        let _lock = FileLock::exclusive(&path)?;
        fs::remove_file(&path).map_err(|e| {
            DossierError::Persistence(format!("delete {}: {e}", path.display()))
        })?;
        info!(session_id, "deleted session");
        Ok(true)
    }

    fn backup(&self, session_id: &str, at: DateTime<Utc>) -> Result<Option<String>> {
        let path = self.session_path(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let backup_path = self.dir.join(format!(
            "{session_id}_backup_{}.json",
            at.format("%Y%m%d_%H%M%S")
        ));

        let _lock = FileLock::shared(&path)?;
        fs::copy(&path, &backup_path).map_err(|e| {
            DossierError::Persistence(format!("backup to {}: {e}", backup_path.display()))
        })?;
        info!(session_id, backup = %backup_path.display(), "created session backup");
        Ok(Some(backup_path.display().to_string()))
    }

    fn list(&self) -> Result<Vec<Session>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| DossierError::io(&self.dir, e))?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            let is_session = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.ends_with(SESSION_SUFFIX));
            if !is_session {
                continue;
            }
            let loaded = FileLock::shared(&path).and_then(|_lock| Self::read_session(&path));
            match loaded {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable session file"),
            }
        }
        Ok(sessions)
    }
}

/// Write `bytes` to a sibling tmp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name"))?;
    let tmp_path = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    let mut tmp = File::create(&tmp_path)?;
    tmp.write_all(bytes)?;
    tmp.sync_all()?;
    drop(tmp);

    fs::rename(&tmp_path, path)
}

/// Advisory lock on the sidecar `.lock` file, released on drop.
///
/// The sidecar is left in place: removing it would let a waiter lock an
/// unlinked inode while a newcomer locks a fresh file.
struct FileLock {
    file: File,
}

impl FileLock {
    fn exclusive(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        file.lock_exclusive()
            .map_err(|e| DossierError::Persistence(format!("exclusive lock failed: {e}")))?;
        Ok(Self { file })
    }

    fn shared(path: &Path) -> Result<Self> {
        let file = Self::open(path)?;
        file.lock_shared()
            .map_err(|e| DossierError::Persistence(format!("shared lock failed: {e}")))?;
        Ok(Self { file })
    }

    fn open(path: &Path) -> Result<File> {
        let lock_path = path.with_extension("lock");
        if let Some(parent) = lock_path.parent() {
            fs::create_dir_all(parent).map_err(|e| DossierError::io(parent, e))?;
        }
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| DossierError::Persistence(format!("open {}: {e}", lock_path.display())))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

// ---------------------------------------------------------------------------
// MemorySessionStore
// ---------------------------------------------------------------------------

/// In-memory store. Sessions are kept as JSON so loads exercise the same codec.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, String>>,
    backups: Mutex<Vec<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert raw JSON for a session id, bypassing encoding.
    pub fn insert_raw(&self, session_id: &str, json: impl Into<String>) {
        self.map().insert(session_id.to_string(), json.into());
    }

    /// Raw JSON currently stored for a session id.
    pub fn raw(&self, session_id: &str) -> Option<String> {
        self.map().get(session_id).cloned()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self, session_id: &str) -> Result<Option<Session>> {
        match self.map().get(session_id) {
            Some(json) => serde_json::from_str(json)
                .map(Some)
                .map_err(|e| DossierError::parse(format!("{session_id}: {e}"))),
            None => Ok(None),
        }
    }

    fn save(&self, session: &Session) -> Result<()> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| DossierError::Persistence(format!("encode session: {e}")))?;
        self.map().insert(session.session_id.clone(), json);
        Ok(())
    }

    fn delete(&self, session_id: &str) -> Result<bool> {
        Ok(self.map().remove(session_id).is_some())
    }

    fn backup(&self, session_id: &str, at: DateTime<Utc>) -> Result<Option<String>> {
        if !self.map().contains_key(session_id) {
            return Ok(None);
        }
        let name = format!("{session_id}_backup_{}", at.format("%Y%m%d_%H%M%S"));
        self.backups
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(name.clone());
        Ok(Some(name))
    }

    fn list(&self) -> Result<Vec<Session>> {
        Ok(self
            .map()
            .values()
            .filter_map(|json| serde_json::from_str(json).ok())
            .collect())
    }
}
