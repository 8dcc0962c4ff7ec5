//! SQL migration definitions for the Dossier cache database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: cache_entries keyed by (kind, key_hash) with expiry",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Search results and fetched page content
CREATE TABLE IF NOT EXISTS cache_entries (
    kind        TEXT NOT NULL,
    key_hash    TEXT NOT NULL,
    key_preview TEXT NOT NULL,
    value_json  TEXT NOT NULL,
    created_at  INTEGER NOT NULL,
    expires_at  INTEGER NOT NULL,
    PRIMARY KEY (kind, key_hash)
);

CREATE INDEX IF NOT EXISTS idx_cache_expires ON cache_entries(expires_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
