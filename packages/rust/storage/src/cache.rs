//! libSQL-backed TTL cache for search results and fetched page content.
//!
//! Entries are namespaced by [`CacheKind`] and keyed by the SHA-256 of the
//! caller's key string. An expired entry is treated as a miss and removed
//! lazily on read; [`Cache::cleanup_expired`] sweeps the rest.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use dossier_shared::{DossierError, Result};
use libsql::{Connection, Database, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::migrations;

/// Characters of the original key kept for diagnostics.
const KEY_PREVIEW_CHARS: usize = 120;

/// Entry namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Search,
    Content,
}

impl CacheKind {
    pub const ALL: [CacheKind; 2] = [CacheKind::Search, CacheKind::Content];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Content => "content",
        }
    }
}

impl std::str::FromStr for CacheKind {
    type Err = DossierError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "search" => Ok(Self::Search),
            "content" => Ok(Self::Content),
            other => Err(DossierError::config(format!(
                "unknown cache kind '{other}': expected 'search' or 'content'"
            ))),
        }
    }
}

/// Entry counts reported by [`Cache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub enabled: bool,
    pub path: Option<PathBuf>,
    pub search_entries: u64,
    pub content_entries: u64,
    pub expired_entries: u64,
}

struct CacheDb {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
}

/// TTL cache handle. A disabled cache misses every read and drops every write.
pub struct Cache {
    inner: Option<CacheDb>,
    path: Option<PathBuf>,
    ttl: Duration,
}

impl Cache {
    /// Open or create the cache database at `path`.
    pub async fn open(path: &Path, ttl: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DossierError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DossierError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| DossierError::Storage(e.to_string()))?;

        let cache = Self {
            inner: Some(CacheDb { db, conn }),
            path: Some(path.to_path_buf()),
            ttl,
        };
        cache.run_migrations().await?;
        Ok(cache)
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            inner: None,
            path: None,
            ttl: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    fn conn(&self) -> Option<&Connection> {
        self.inner.as_ref().map(|i| &i.conn)
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let Some(conn) = self.conn() else {
            return Ok(());
        };
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                conn.execute_batch(migration.sql).await.map_err(|e| {
                    DossierError::Storage(format!("migration v{} failed: {e}", migration.version))
                })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let Some(conn) = self.conn() else {
            return 0;
        };
        match conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    // -----------------------------------------------------------------------
    // Entry operations
    // -----------------------------------------------------------------------

    /// Look up a live entry. Expired or undecodable entries count as misses.
    pub async fn get<T: DeserializeOwned>(&self, kind: CacheKind, key: &str) -> Result<Option<T>> {
        let Some(conn) = self.conn() else {
            return Ok(None);
        };
        let key_hash = hash_key(key);
        let mut rows = conn
            .query(
                "SELECT value_json, expires_at FROM cache_entries WHERE kind = ?1 AND key_hash = ?2",
                params![kind.as_str(), key_hash.as_str()],
            )
            .await
            .map_err(|e| DossierError::Storage(e.to_string()))?;

        let row = match rows.next().await {
            Ok(Some(row)) => row,
            Ok(None) => return Ok(None),
            Err(e) => return Err(DossierError::Storage(e.to_string())),
        };

        let value_json: String = row
            .get(0)
            .map_err(|e| DossierError::Storage(e.to_string()))?;
        let expires_at: i64 = row
            .get(1)
            .map_err(|e| DossierError::Storage(e.to_string()))?;

        if expires_at <= now_millis() {
            debug!(kind = kind.as_str(), "cache entry expired");
            self.delete(kind, key).await?;
            return Ok(None);
        }

        match serde_json::from_str(&value_json) {
            Ok(value) => {
                debug!(kind = kind.as_str(), "cache hit");
                Ok(Some(value))
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "discarding undecodable cache entry");
                self.delete(kind, key).await?;
                Ok(None)
            }
        }
    }

    /// Store a value with the default TTL (upserts).
    pub async fn set<T: Serialize>(&self, kind: CacheKind, key: &str, value: &T) -> Result<()> {
        self.set_with_ttl(kind, key, value, self.ttl).await
    }

    /// Store a value with an explicit TTL (upserts).
    pub async fn set_with_ttl<T: Serialize>(
        &self,
        kind: CacheKind,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<()> {
        let Some(conn) = self.conn() else {
            return Ok(());
        };
        let value_json = serde_json::to_string(value)
            .map_err(|e| DossierError::Storage(format!("cache encode failed: {e}")))?;
        let now = now_millis();
        let expires_at = now.saturating_add(ttl.as_millis() as i64);
        let preview: String = key.chars().take(KEY_PREVIEW_CHARS).collect();

        conn.execute(
            "INSERT INTO cache_entries (kind, key_hash, key_preview, value_json, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(kind, key_hash) DO UPDATE SET
               value_json = excluded.value_json,
               created_at = excluded.created_at,
               expires_at = excluded.expires_at",
            params![
                kind.as_str(),
                hash_key(key),
                preview,
                value_json,
                now,
                expires_at
            ],
        )
        .await
        .map_err(|e| DossierError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Remove one entry. Returns whether anything was deleted.
    pub async fn delete(&self, kind: CacheKind, key: &str) -> Result<bool> {
        let Some(conn) = self.conn() else {
            return Ok(false);
        };
        let affected = conn
            .execute(
                "DELETE FROM cache_entries WHERE kind = ?1 AND key_hash = ?2",
                params![kind.as_str(), hash_key(key)],
            )
            .await
            .map_err(|e| DossierError::Storage(e.to_string()))?;
        Ok(affected > 0)
    }

    /// Remove every entry, or only those of one kind. Returns the count removed.
    pub async fn clear(&self, kind: Option<CacheKind>) -> Result<u64> {
        let Some(conn) = self.conn() else {
            return Ok(0);
        };
        let affected = match kind {
            Some(kind) => conn
                .execute(
                    "DELETE FROM cache_entries WHERE kind = ?1",
                    params![kind.as_str()],
                )
                .await,
            None => conn.execute("DELETE FROM cache_entries", params![]).await,
        }
        .map_err(|e| DossierError::Storage(e.to_string()))?;

        info!(count = affected, "cleared cache entries");
        Ok(affected)
    }

    /// Remove expired entries. Returns the count removed.
    pub async fn cleanup_expired(&self) -> Result<u64> {
        let Some(conn) = self.conn() else {
            return Ok(0);
        };
        let affected = conn
            .execute(
                "DELETE FROM cache_entries WHERE expires_at <= ?1",
                params![now_millis()],
            )
            .await
            .map_err(|e| DossierError::Storage(e.to_string()))?;

        info!(count = affected, "cleaned up expired cache entries");
        Ok(affected)
    }

    /// Entry counts per kind.
    pub async fn stats(&self) -> Result<CacheStats> {
        let Some(conn) = self.conn() else {
            return Ok(CacheStats::default());
        };
        let mut stats = CacheStats {
            enabled: true,
            path: self.path.clone(),
            ..CacheStats::default()
        };

        let mut rows = conn
            .query(
                "SELECT kind, COUNT(*), SUM(CASE WHEN expires_at <= ?1 THEN 1 ELSE 0 END)
                 FROM cache_entries GROUP BY kind",
                params![now_millis()],
            )
            .await
            .map_err(|e| DossierError::Storage(e.to_string()))?;

        while let Ok(Some(row)) = rows.next().await {
            let kind: String = row
                .get(0)
                .map_err(|e| DossierError::Storage(e.to_string()))?;
            let count = row.get::<i64>(1).unwrap_or(0).max(0) as u64;
            let expired = row.get::<i64>(2).unwrap_or(0).max(0) as u64;
            match kind.as_str() {
                "search" => stats.search_entries = count,
                "content" => stats.content_entries = count,
                _ => {}
            }
            stats.expired_entries += expired;
        }
        Ok(stats)
    }
}

/// SHA-256 hex digest of a cache key.
pub fn hash_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use dossier_shared::SearchResult;
    use uuid::Uuid;

    /// Create a temp file cache for testing.
    async fn test_cache() -> Cache {
        let tmp = std::env::temp_dir().join(format!("dossier_cache_{}.db", Uuid::now_v7()));
        Cache::open(&tmp, Duration::from_secs(3600))
            .await
            .expect("open test cache")
    }

    fn sample_results() -> Vec<SearchResult> {
        vec![SearchResult {
            title: "Asthma prevalence".into(),
            url: "https://example.org/asthma".into(),
            description: "National survey".into(),
            source: "example.org".into(),
        }]
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let cache = test_cache().await;
        assert_eq!(cache.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("dossier_cache_{}.db", Uuid::now_v7()));
        let first = Cache::open(&tmp, Duration::from_secs(60)).await.expect("first open");
        drop(first);
        let second = Cache::open(&tmp, Duration::from_secs(60)).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn set_get_delete() {
        let cache = test_cache().await;
        let key = "asthma prevalence france|fr|10";

        let miss: Option<Vec<SearchResult>> = cache.get(CacheKind::Search, key).await.unwrap();
        assert!(miss.is_none());

        cache.set(CacheKind::Search, key, &sample_results()).await.unwrap();
        let hit: Option<Vec<SearchResult>> = cache.get(CacheKind::Search, key).await.unwrap();
        assert_eq!(hit, Some(sample_results()));

        // Same key under another kind is a different entry
        let other: Option<Vec<SearchResult>> = cache.get(CacheKind::Content, key).await.unwrap();
        assert!(other.is_none());

        assert!(cache.delete(CacheKind::Search, key).await.unwrap());
        assert!(!cache.delete(CacheKind::Search, key).await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let cache = test_cache().await;
        cache
            .set_with_ttl(CacheKind::Content, "https://a.example", &"body", Duration::ZERO)
            .await
            .unwrap();
        let value: Option<String> = cache.get(CacheKind::Content, "https://a.example").await.unwrap();
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn cleanup_and_clear() {
        let cache = test_cache().await;
        cache
            .set_with_ttl(CacheKind::Content, "old", &"x", Duration::ZERO)
            .await
            .unwrap();
        cache.set(CacheKind::Content, "fresh", &"y").await.unwrap();
        cache.set(CacheKind::Search, "q", &sample_results()).await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert!(stats.enabled);
        assert_eq!(stats.content_entries, 2);
        assert_eq!(stats.search_entries, 1);
        assert_eq!(stats.expired_entries, 1);

        assert_eq!(cache.cleanup_expired().await.unwrap(), 1);
        assert_eq!(cache.clear(Some(CacheKind::Search)).await.unwrap(), 1);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.search_entries, 0);
        assert_eq!(stats.content_entries, 1);

        assert_eq!(cache.clear(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let cache = Cache::disabled();
        cache.set(CacheKind::Search, "q", &sample_results()).await.unwrap();
        let value: Option<Vec<SearchResult>> = cache.get(CacheKind::Search, "q").await.unwrap();
        assert!(value.is_none());
        assert!(!cache.stats().await.unwrap().enabled);
    }

    #[test]
    fn key_hash_is_stable_sha256() {
        assert_eq!(hash_key("a"), hash_key("a"));
        assert_ne!(hash_key("a"), hash_key("b"));
        assert_eq!(hash_key("").len(), 64);
    }
}
