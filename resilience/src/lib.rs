//! Resilience primitives for GrantRadar's external calls
//!
//! Circuit breakers guard every external service, retries use exponential
//! backoff with jitter, and latency windows feed health reporting and the
//! LLM failover decision.

pub mod circuit_breaker;
pub mod latency;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSummary, CircuitState,
};
pub use latency::{LatencyStats, LatencyWindow};
pub use retry::{is_retryable_status, retry, RetryConfig, RetryError};
