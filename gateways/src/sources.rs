//! Per-source circuit breaker registry
//!
//! Each grant source (nsf, nih, grants_gov, ...) gets its own breaker so a
//! broken upstream only silences its own discovery agent.

use grantradar_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSummary};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Registry of circuit breakers keyed by source name
#[derive(Default)]
pub struct SourceGate {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl SourceGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Breaker for a source, created on first use
    pub fn for_source(&self, source: &str) -> Arc<CircuitBreaker> {
        let mut breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        breakers
            .entry(source.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(CircuitBreakerConfig::for_service(
                    source,
                )))
            })
            .clone()
    }

    /// Snapshots of all known breakers for the status report
    pub fn summaries(&self) -> Vec<CircuitBreakerSummary> {
        let breakers = match self.breakers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        breakers.values().map(|b| b.summary()).collect()
    }
}
