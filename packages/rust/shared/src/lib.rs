//! Shared types, error model, and configuration for Dossier.
//!
//! This crate is the foundation depended on by all other Dossier crates.
//! It provides:
//! - [`DossierError`]: the unified error type
//! - Session types ([`Session`], [`DomainRecord`], [`DataTable`], [`QualitySummary`])
//! - Configuration ([`AppConfig`], [`ResearchConfig`], [`SearchSettings`], config loading)
//! - Retry primitives ([`RetryPolicy`], [`retry_with_backoff`], [`AdaptiveRateLimiter`])

pub mod clock;
pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{
    AppConfig, CacheConfig, DefaultsConfig, LlmConfig, ResearchConfig, ResearchMode,
    RetryConfig, SearchConfig, SearchSettings, config_dir, config_file_path, expand_home,
    init_config, load_config, load_config_from, resolve_api_key, validate_api_keys,
};
pub use error::{DossierError, Result};
pub use retry::{AdaptiveRateLimiter, RetryPolicy, classify_status, retry_with_backoff};
pub use types::{
    CURRENT_SCHEMA_VERSION, Confidence, DEFAULT_MIN_ROWS, DataTable, DomainRecord, DomainStatus,
    FetchedContent, ParseMethod, QualitySummary, Row, SearchLogEntry, SearchResult, Session,
    SessionStatus, TokenUsage, render_row, session_slug,
};
