//! Circuit breaker for external service calls
//!
//! States:
//! - CLOSED: normal operation
//! - OPEN: failing, reject all requests until the recovery timeout elapses
//! - HALF_OPEN: probing whether the service has recovered
//!
//! Callers use the record-style API: check `can_execute`, perform the call,
//! then report the outcome with `record_success` or `record_failure`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing, reject requests
    Open,
    /// Testing if recovered
    HalfOpen,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Service name used in logs and the replicated summary
    pub service: String,
    /// Failures before opening
    pub failure_threshold: u64,
    /// Successes before closing from half-open
    pub success_threshold: u64,
    /// Time to wait before probing again
    pub recovery_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Default configuration for a named service
    pub fn for_service(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            failure_threshold: 5,
            success_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

/// Serializable snapshot of breaker state, mirrored to the store for
/// dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerSummary {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u64,
    pub failure_threshold: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub recovery_timeout_secs: u64,
}

/// Circuit breaker guarding a single external service
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8, // 0=Closed, 1=Open, 2=HalfOpen
    failure_count: AtomicU64,
    success_count: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
    last_failure_at: Mutex<Option<DateTime<Utc>>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(0),
            failure_count: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            opened_at: Mutex::new(None),
            last_failure_at: Mutex::new(None),
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// An open circuit transitions to half-open once the recovery timeout
    /// has elapsed, letting a single probe through.
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = match self.opened_at.lock() {
                    Ok(guard) => (*guard).map(|at| at.elapsed()),
                    Err(_) => None,
                };

                match elapsed {
                    Some(elapsed) if elapsed >= self.config.recovery_timeout => {
                        self.state.store(2, Ordering::SeqCst); // HalfOpen
                        self.success_count.store(0, Ordering::SeqCst);
                        info!(
                            service = %self.config.service,
                            "circuit breaker half-open, probing recovery"
                        );
                        true
                    }
                    _ => false,
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);

        if self.state() == CircuitState::HalfOpen {
            let successes = self.success_count.fetch_add(1, Ordering::SeqCst) + 1;
            if successes >= self.config.success_threshold {
                self.state.store(0, Ordering::SeqCst); // Closed
                self.success_count.store(0, Ordering::SeqCst);
                info!(
                    service = %self.config.service,
                    successes, "circuit breaker closed"
                );
            }
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let failures = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut guard) = self.last_failure_at.lock() {
            *guard = Some(Utc::now());
        }

        let half_open = self.state() == CircuitState::HalfOpen;
        if half_open || failures >= self.config.failure_threshold {
            self.state.store(1, Ordering::SeqCst); // Open
            self.success_count.store(0, Ordering::SeqCst);
            if let Ok(mut guard) = self.opened_at.lock() {
                *guard = Some(Instant::now());
            }
            warn!(
                service = %self.config.service,
                failures,
                recovery_secs = self.config.recovery_timeout.as_secs(),
                "circuit breaker opened"
            );
        }
    }

    /// Current circuit state
    pub fn state(&self) -> CircuitState {
        match self.state.load(Ordering::SeqCst) {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    /// Current consecutive failure count
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::SeqCst)
    }

    /// Reset to closed (manual intervention or tests)
    pub fn reset(&self) {
        self.state.store(0, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.success_count.store(0, Ordering::SeqCst);
        if let Ok(mut guard) = self.opened_at.lock() {
            *guard = None;
        }
        info!(service = %self.config.service, "circuit breaker reset");
    }

    /// Snapshot for dashboards and the orchestrator status report
    pub fn summary(&self) -> CircuitBreakerSummary {
        CircuitBreakerSummary {
            service: self.config.service.clone(),
            state: self.state(),
            failure_count: self.failure_count(),
            failure_threshold: self.config.failure_threshold,
            last_failure_at: self.last_failure_at.lock().ok().and_then(|g| *g),
            recovery_timeout_secs: self.config.recovery_timeout.as_secs(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.config.service)
            .field("state", &self.state())
            .field("failure_count", &self.failure_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u64, recovery: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            service: "test".to_string(),
            failure_threshold: threshold,
            success_threshold: 1,
            recovery_timeout: recovery,
        })
    }

    #[test]
    fn starts_closed_and_allows_execution() {
        let cb = breaker(3, Duration::from_secs(60));
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_execute());
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn success_resets_failure_count() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn recovers_through_half_open() {
        let cb = breaker(1, Duration::from_millis(0));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Zero recovery timeout lets the next check probe immediately
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(0));
        cb.record_failure();
        assert!(cb.can_execute());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn summary_reflects_state() {
        let cb = breaker(1, Duration::from_secs(60));
        cb.record_failure();
        let summary = cb.summary();
        assert_eq!(summary.service, "test");
        assert_eq!(summary.state, CircuitState::Open);
        assert_eq!(summary.failure_count, 1);
        assert!(summary.last_failure_at.is_some());
    }
}
