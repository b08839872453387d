//! Retry logic with exponential backoff and jitter
//!
//! Used by every HTTP client in the system. Only transient failures are
//! retried: connection errors, timeouts, HTTP 408/429 and 5xx.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::warn;

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,
    /// Initial delay between attempts (ms)
    pub initial_delay_ms: u64,
    /// Cap on the delay between attempts (ms)
    pub max_delay_ms: u64,
    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 = none, 1.0 = full)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt, where `attempt` is 1-based.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut delay_ms = (base as u64).min(self.max_delay_ms);

        if self.jitter_factor > 0.0 {
            let jitter_range = (delay_ms as f64 * self.jitter_factor) as u64;
            if jitter_range > 0 {
                let jitter = rand::thread_rng().gen_range(0..=jitter_range);
                delay_ms = delay_ms.saturating_sub(jitter);
            }
        }

        Duration::from_millis(delay_ms)
    }
}

/// Retry error
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    #[error("max retry attempts exceeded after {attempts}: {last_error}")]
    MaxAttemptsExceeded { attempts: u32, last_error: String },

    #[error("non-retryable error: {0}")]
    NonRetryable(String),
}

/// Whether an HTTP status is worth retrying.
///
/// Retryable: 408 (request timeout), 429 (rate limit), all 5xx. Other 4xx
/// indicate caller bugs and are surfaced immediately.
pub fn is_retryable_status(status: u16) -> bool {
    status == 408 || status == 429 || (500..=599).contains(&status)
}

/// Execute `operation` with retries.
///
/// The classifier decides whether a given error is transient; non-transient
/// errors short-circuit without sleeping.
pub async fn retry<F, Fut, T, E>(
    config: &RetryConfig,
    label: &str,
    mut operation: F,
    is_transient: impl Fn(&E) -> bool,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_transient(&error) {
                    return Err(RetryError::NonRetryable(error.to_string()));
                }

                if attempt >= config.max_attempts {
                    return Err(RetryError::MaxAttemptsExceeded {
                        attempts: attempt,
                        last_error: error.to_string(),
                    });
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    %label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "transient failure, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
