//! Error types for Dossier.
//!
//! Library crates use [`DossierError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Dossier operations.
#[derive(Debug, thiserror::Error)]
pub enum DossierError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error that is neither a rate limit nor a server fault.
    #[error("network error: {0}")]
    Network(String),

    /// The upstream API asked us to slow down (HTTP 429).
    #[error("rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<f64> },

    /// Temporary failure: timeout, connection reset, HTTP 5xx.
    #[error("transient error: {0}")]
    Transient(String),

    /// Client error (4xx other than 429). Never retried.
    #[error("client error (HTTP {status}): {message}")]
    PermanentClient { status: u16, message: String },

    /// Malformed data that could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Cache database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Session checkpoint could not be read, locked, or written.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// LLM request or response error.
    #[error("llm error: {0}")]
    Llm(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Domain output failed validation in strict mode, or bad input data.
    #[error("validation error: {message}")]
    Validation { message: String },

    /// HTML-to-Markdown conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DossierError>;

impl DossierError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Transient(_))
    }

    /// Whether this is a non-retryable client-side rejection.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::PermanentClient { .. })
    }

    /// Server-provided retry hint, if any.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}
