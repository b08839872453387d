//! Orchestrator data model: health, scaling, SLOs, on-call alerts

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status values for agents and endpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Health state of one agent, derived from its heartbeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Set when the agent went unhealthy; cleared on recovery
    pub downtime_started_at: Option<DateTime<Utc>>,
}

impl AgentHealth {
    pub fn unknown(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: HealthStatus::Unknown,
            last_heartbeat: None,
            downtime_started_at: None,
        }
    }

    /// Seconds since the agent went down, 0 when healthy
    pub fn downtime_seconds(&self) -> f64 {
        self.downtime_started_at
            .map(|at| (Utc::now() - at).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }

    /// Whether the downtime warrants an on-call page
    pub fn needs_alert(&self, threshold_seconds: f64) -> bool {
        self.status == HealthStatus::Unhealthy && self.downtime_seconds() >= threshold_seconds
    }
}

/// Health state of one probed endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointHealth {
    pub name: String,
    pub url: String,
    pub status: HealthStatus,
    pub latency_ms: f64,
    pub last_check: DateTime<Utc>,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
}

/// Auto-scaling recommendation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerScalingDecision {
    pub queue_name: String,
    pub current_workers: usize,
    pub target_workers: usize,
    pub reason: String,
    pub queue_depth: u64,
    pub threshold: u64,
}

/// Service level objective status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SloStatus {
    pub name: String,
    pub target: f64,
    pub current: f64,
    pub unit: String,
    pub is_met: bool,
    pub window_hours: u32,
}

impl SloStatus {
    pub fn create(
        name: &str,
        target: f64,
        current: f64,
        unit: &str,
        higher_is_better: bool,
    ) -> Self {
        let is_met = if higher_is_better {
            current >= target
        } else {
            current <= target
        };

        Self {
            name: name.to_string(),
            target,
            current,
            unit: unit.to_string(),
            is_met,
            window_hours: 24,
        }
    }
}

/// Alert handed to the on-call notifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnCallAlert {
    /// critical or warning
    pub severity: String,
    pub title: String,
    pub message: String,
    pub agent_name: Option<String>,
    pub endpoint_name: Option<String>,
    pub downtime_seconds: f64,
    pub created_at: DateTime<Utc>,
}

/// Pluggable on-call alert sink
pub trait OnCallNotifier: Send + Sync {
    fn notify(&self, alert: OnCallAlert);
}

/// Default notifier that only logs
pub struct LogNotifier;

impl OnCallNotifier for LogNotifier {
    fn notify(&self, alert: OnCallAlert) {
        tracing::warn!(
            severity = %alert.severity,
            title = %alert.title,
            message = %alert.message,
            "on-call alert"
        );
    }
}

/// Aggregated snapshot stored for dashboards
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub timestamp: DateTime<Utc>,
    pub queue_depths: std::collections::HashMap<String, u64>,
    pub stage_latencies: std::collections::HashMap<String, f64>,
    pub success_rates: std::collections::HashMap<String, f64>,
    pub alerts_sent: u64,
    pub alert_delivery_rate: f64,
    pub llm_p95_latency_ms: f64,
    pub active_pipelines: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn slo_direction_lower_is_better() {
        let slo = SloStatus::create("Pipeline Latency (p95)", 120.0, 95.0, "seconds", false);
        assert!(slo.is_met);
        let slo = SloStatus::create("Pipeline Latency (p95)", 120.0, 130.0, "seconds", false);
        assert!(!slo.is_met);
    }

    #[test]
    fn slo_direction_higher_is_better() {
        let slo = SloStatus::create("Pipeline Success Rate", 99.0, 99.5, "percent", true);
        assert!(slo.is_met);
        let slo = SloStatus::create("Pipeline Success Rate", 99.0, 98.0, "percent", true);
        assert!(!slo.is_met);
    }

    #[test]
    fn agent_downtime_and_alerting() {
        let mut health = AgentHealth::unknown("matching");
        assert!(!health.needs_alert(300.0));

        health.status = HealthStatus::Unhealthy;
        health.downtime_started_at = Some(Utc::now() - Duration::seconds(400));
        assert!(health.downtime_seconds() >= 400.0);
        assert!(health.needs_alert(300.0));

        health.downtime_started_at = Some(Utc::now() - Duration::seconds(100));
        assert!(!health.needs_alert(300.0));
    }
}
