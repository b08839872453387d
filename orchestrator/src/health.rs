//! Health checking
//!
//! Probes the bus (PING), the entity store (trivial query), each external
//! source endpoint (HEAD), and agent heartbeats. Per-probe latencies go
//! into bounded rings; endpoints flip to unhealthy after three consecutive
//! failures.

use crate::models::{AgentHealth, EndpointHealth, HealthStatus};
use chrono::{DateTime, Utc};
use grantradar_events::{EventBus, KvStore};
use grantradar_resilience::{LatencyStats, LatencyWindow};
use grantradar_storage::EntityStore;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Consecutive failures before an endpoint is unhealthy
pub const FAILURE_THRESHOLD: u32 = 3;
/// Heartbeats older than this mark an agent down
pub const HEARTBEAT_TIMEOUT_SECS: i64 = 60;
/// HEAD probe timeout
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);
/// Latency ring size per endpoint
const LATENCY_WINDOW: usize = 1000;

/// The agent roles whose heartbeats are watched
pub const AGENT_NAMES: [&str; 4] = ["discovery", "curation", "matching", "delivery"];

/// Full health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub overall_status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub endpoints: HashMap<String, EndpointHealth>,
    pub agents: HashMap<String, AgentHealth>,
    pub latencies: HashMap<String, LatencyStats>,
}

/// Health checker for bus, store, sources, and agents
pub struct HealthChecker {
    bus: EventBus,
    kv: KvStore,
    store: EntityStore,
    http: reqwest::Client,
    /// (name, url) pairs probed with HEAD requests
    source_endpoints: Vec<(String, String)>,
    latencies: HashMap<String, LatencyWindow>,
    endpoint_health: HashMap<String, EndpointHealth>,
    agent_health: HashMap<String, AgentHealth>,
}

impl HealthChecker {
    pub fn new(
        bus: EventBus,
        kv: KvStore,
        store: EntityStore,
        source_endpoints: Vec<(String, String)>,
    ) -> Self {
        Self {
            bus,
            kv,
            store,
            http: reqwest::Client::builder()
                .timeout(HEAD_TIMEOUT)
                .build()
                .unwrap_or_default(),
            source_endpoints,
            latencies: HashMap::new(),
            endpoint_health: HashMap::new(),
            agent_health: HashMap::new(),
        }
    }

    fn record_latency(&mut self, name: &str, latency_ms: f64) {
        self.latencies
            .entry(name.to_string())
            .or_insert_with(|| LatencyWindow::new(LATENCY_WINDOW))
            .record(latency_ms);
    }

    fn update_endpoint(
        &mut self,
        name: &str,
        url: &str,
        ok: bool,
        latency_ms: f64,
        error: Option<String>,
    ) -> EndpointHealth {
        let consecutive_failures = match self.endpoint_health.get(name) {
            Some(previous) if !ok => previous.consecutive_failures + 1,
            _ if !ok => 1,
            _ => 0,
        };

        let status = endpoint_status(ok, consecutive_failures);

        let health = EndpointHealth {
            name: name.to_string(),
            url: url.to_string(),
            status,
            latency_ms,
            last_check: Utc::now(),
            last_error: error,
            consecutive_failures,
        };

        self.endpoint_health.insert(name.to_string(), health.clone());
        health
    }

    /// Bus reachability and latency
    pub async fn check_bus(&mut self) -> EndpointHealth {
        match self.bus.ping().await {
            Ok(latency_ms) => {
                self.record_latency("bus", latency_ms);
                self.update_endpoint("bus", "redis", true, latency_ms, None)
            }
            Err(err) => {
                error!(error = %err, "bus health check failed");
                self.update_endpoint("bus", "redis", false, 0.0, Some(err.to_string()))
            }
        }
    }

    /// Entity store reachability and latency
    pub async fn check_store(&mut self) -> EndpointHealth {
        match self.store.health_check().await {
            Ok(latency_ms) => {
                self.record_latency("store", latency_ms);
                self.update_endpoint("store", "postgres", true, latency_ms, None)
            }
            Err(err) => {
                error!(error = %err, "store health check failed");
                self.update_endpoint("store", "postgres", false, 0.0, Some(err.to_string()))
            }
        }
    }

    /// HEAD probe of one external source endpoint
    pub async fn check_source(&mut self, name: &str, url: &str) -> EndpointHealth {
        let start = Instant::now();
        match self.http.head(url).send().await {
            Ok(response) => {
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
                self.record_latency(name, latency_ms);

                if response.status().as_u16() < 500 {
                    self.update_endpoint(name, url, true, latency_ms, None)
                } else {
                    self.update_endpoint(
                        name,
                        url,
                        false,
                        latency_ms,
                        Some(format!("HTTP {}", response.status().as_u16())),
                    )
                }
            }
            Err(err) => {
                warn!(endpoint = name, error = %err, "source probe failed");
                self.update_endpoint(name, url, false, 0.0, Some(err.to_string()))
            }
        }
    }

    /// Derive one agent's health from its heartbeat
    pub async fn check_agent(&mut self, agent: &str) -> AgentHealth {
        let heartbeat = match self.kv.read_heartbeat(agent).await {
            Ok(heartbeat) => heartbeat,
            Err(err) => {
                warn!(agent, error = %err, "heartbeat read failed");
                None
            }
        };

        let previous = self.agent_health.get(agent);

        let health = match heartbeat {
            None => AgentHealth::unknown(agent),
            Some(last_heartbeat) => {
                let age = (Utc::now() - last_heartbeat).num_seconds();
                if age > HEARTBEAT_TIMEOUT_SECS {
                    AgentHealth {
                        name: agent.to_string(),
                        status: HealthStatus::Unhealthy,
                        last_heartbeat: Some(last_heartbeat),
                        // Downtime started when the last heartbeat landed
                        downtime_started_at: previous
                            .and_then(|p| p.downtime_started_at)
                            .or(Some(last_heartbeat)),
                    }
                } else {
                    AgentHealth {
                        name: agent.to_string(),
                        status: HealthStatus::Healthy,
                        last_heartbeat: Some(last_heartbeat),
                        downtime_started_at: None,
                    }
                }
            }
        };

        self.agent_health.insert(agent.to_string(), health.clone());
        health
    }

    /// Run every probe and assemble the report
    pub async fn check_all(&mut self) -> HealthReport {
        self.check_bus().await;
        self.check_store().await;

        let endpoints = self.source_endpoints.clone();
        for (name, url) in endpoints {
            self.check_source(&name, &url).await;
        }

        for agent in AGENT_NAMES {
            self.check_agent(agent).await;
        }

        let unhealthy = self
            .endpoint_health
            .values()
            .any(|e| e.status == HealthStatus::Unhealthy)
            || self
                .agent_health
                .values()
                .any(|a| a.status == HealthStatus::Unhealthy);
        let degraded = self
            .endpoint_health
            .values()
            .any(|e| e.status == HealthStatus::Degraded)
            || self
                .agent_health
                .values()
                .any(|a| a.status == HealthStatus::Degraded);

        let overall_status = if unhealthy {
            HealthStatus::Unhealthy
        } else if degraded {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        HealthReport {
            overall_status,
            timestamp: Utc::now(),
            endpoints: self.endpoint_health.clone(),
            agents: self.agent_health.clone(),
            latencies: self
                .latencies
                .iter()
                .map(|(name, window)| (name.clone(), window.stats()))
                .collect(),
        }
    }
}

/// Status for an endpoint given probe outcome and failure streak
fn endpoint_status(ok: bool, consecutive_failures: u32) -> HealthStatus {
    if ok {
        HealthStatus::Healthy
    } else if consecutive_failures >= FAILURE_THRESHOLD {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn endpoints_need_three_failures_to_go_unhealthy() {
        assert_eq!(endpoint_status(true, 0), HealthStatus::Healthy);
        assert_eq!(endpoint_status(false, 1), HealthStatus::Degraded);
        assert_eq!(endpoint_status(false, 2), HealthStatus::Degraded);
        assert_eq!(endpoint_status(false, 3), HealthStatus::Unhealthy);
        assert_eq!(endpoint_status(false, 7), HealthStatus::Unhealthy);
    }

    #[test]
    fn heartbeat_staleness_boundary() {
        let fresh = Utc::now() - Duration::seconds(30);
        let stale = Utc::now() - Duration::seconds(90);

        assert!((Utc::now() - fresh).num_seconds() <= HEARTBEAT_TIMEOUT_SECS);
        assert!((Utc::now() - stale).num_seconds() > HEARTBEAT_TIMEOUT_SECS);
    }
}
