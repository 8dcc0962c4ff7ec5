//! Retry and backoff primitives for HTTP collaborators.
//!
//! - [`classify_status`] maps a non-success HTTP status to a [`DossierError`]
//!   variant so callers can decide whether to retry.
//! - [`retry_with_backoff`] re-runs an async operation on retryable errors,
//!   waiting `min_wait * 2^attempt` clamped to `[min_wait, max_wait]`.
//! - [`AdaptiveRateLimiter`] spaces out requests, slowing down on rate limits
//!   and speeding back up after a run of successes.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::AppConfig;
use crate::error::{DossierError, Result};

/// Maximum characters of a response body kept in an error message.
const ERROR_BODY_CHARS: usize = 200;

/// Successes needed before the rate limiter halves its delay.
const SUCCESSES_BEFORE_SPEEDUP: u32 = 5;

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Attempt budget and wait bounds for one class of calls.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first try included. Zero is treated as one.
    pub max_attempts: u32,
    pub min_wait: Duration,
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            min_wait: Duration::from_secs(2),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl From<&AppConfig> for RetryPolicy {
    fn from(config: &AppConfig) -> Self {
        Self {
            max_attempts: config.retry.max_attempts,
            min_wait: Duration::from_millis(config.retry.min_wait_ms),
            max_wait: Duration::from_millis(config.retry.max_wait_ms),
        }
    }
}

impl RetryPolicy {
    /// A policy that never waits; used by tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            min_wait: Duration::ZERO,
            max_wait: Duration::ZERO,
        }
    }

    /// Wait before retrying after the given zero-based failed attempt.
    pub fn wait_for(&self, attempt: u32, err: &DossierError) -> Duration {
        if let Some(secs) = err.retry_after() {
            return capped_hint(secs, self.max_wait);
        }
        let factor = 2u32.saturating_pow(attempt);
        self.min_wait
            .saturating_mul(factor)
            .clamp(self.min_wait, self.max_wait.max(self.min_wait))
    }
}

/// A server-provided wait in seconds, never longer than `cap`.
fn capped_hint(secs: f64, cap: Duration) -> Duration {
    Duration::try_from_secs_f64(secs.max(0.0))
        .unwrap_or(cap)
        .min(cap)
}

// ---------------------------------------------------------------------------
// HTTP status classification
// ---------------------------------------------------------------------------

/// Convert a non-success HTTP status into the matching error variant.
///
/// 429 becomes [`DossierError::RateLimited`] with the `Retry-After` value,
/// 5xx becomes [`DossierError::Transient`], any other status becomes
/// [`DossierError::PermanentClient`].
pub fn classify_status(status: u16, retry_after: Option<&str>, body: &str) -> DossierError {
    let snippet: String = body.chars().take(ERROR_BODY_CHARS).collect();
    match status {
        429 => DossierError::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0),
        },
        s if s >= 500 => DossierError::Transient(format!("server error: {s} - {snippet}")),
        s => DossierError::PermanentClient {
            status: s,
            message: snippet,
        },
    }
}

// ---------------------------------------------------------------------------
// retry_with_backoff
// ---------------------------------------------------------------------------

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let wait = policy.wait_for(attempt, &e);
                warn!(
                    label,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    wait_ms = wait.as_millis() as u64,
                    error = %e,
                    "retrying after error"
                );
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// AdaptiveRateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct LimiterState {
    current_delay: Duration,
    consecutive_successes: u32,
}

/// Delay between outbound requests that adapts to rate-limit responses.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(base_delay: Duration) -> Self {
        Self::with_max(base_delay, Duration::from_secs(30))
    }

    pub fn with_max(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay: max_delay.max(base_delay),
            state: Mutex::new(LimiterState {
                current_delay: base_delay,
                consecutive_successes: 0,
            }),
        }
    }

    pub fn current_delay(&self) -> Duration {
        self.lock().current_delay
    }

    /// Sleep for the current delay.
    pub async fn wait(&self) {
        let delay = self.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Record a successful request; every fifth in a row halves the delay.
    pub fn on_success(&self) {
        let mut state = self.lock();
        state.consecutive_successes += 1;
        if state.consecutive_successes >= SUCCESSES_BEFORE_SPEEDUP {
            state.current_delay = (state.current_delay / 2).max(self.base_delay);
            state.consecutive_successes = 0;
            debug!(delay_ms = state.current_delay.as_millis() as u64, "rate limiter: decreased delay");
        }
    }

    /// Record a rate-limit response; honours a server hint, otherwise doubles.
    pub fn on_rate_limit(&self, retry_after: Option<f64>) {
        let mut state = self.lock();
        state.consecutive_successes = 0;
        state.current_delay = match retry_after {
            Some(secs) if secs > 0.0 => capped_hint(secs, self.max_delay),
            _ => (state.current_delay.saturating_mul(2)).min(self.max_delay),
        };
        warn!(delay_ms = state.current_delay.as_millis() as u64, "rate limiter: increased delay");
    }

    pub fn reset(&self) {
        let mut state = self.lock();
        state.current_delay = self.base_delay;
        state.consecutive_successes = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        // A poisoned lock only means a panic elsewhere; the state is still usable.
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}
