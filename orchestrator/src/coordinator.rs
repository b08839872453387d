//! The orchestrator
//!
//! Passive observer of the pipeline: every 30 seconds it runs health
//! checks, fires on-call alerts for prolonged agent downtime and repeated
//! endpoint failures, collects metrics (every 60 seconds), retries stalled
//! pipelines, and evaluates scaling. Agents never call into it; all inputs
//! arrive through heartbeats, pipeline state records, and metric samples.

use crate::health::{HealthChecker, HealthReport};
use crate::metrics::MetricsCollector;
use crate::models::{HealthStatus, OnCallAlert, OnCallNotifier};
use crate::queues::PriorityQueueManager;
use crate::tracker::PipelineTracker;
use anyhow::Result;
use chrono::{DateTime, Utc};
use grantradar_gateways::{LlmClient, SourceGate};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Monitoring loop cadence
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
/// Agent downtime before an on-call page
pub const ON_CALL_ALERT_THRESHOLD_SECS: f64 = 300.0;
/// Metrics collection cadence
pub const METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// The orchestrator
pub struct Orchestrator {
    tracker: PipelineTracker,
    queues: PriorityQueueManager,
    health: HealthChecker,
    metrics: MetricsCollector,
    source_gate: Arc<SourceGate>,
    notifier: Arc<dyn OnCallNotifier>,
    last_metrics_collection: Option<DateTime<Utc>>,
    last_report: Option<HealthReport>,
}

impl Orchestrator {
    pub fn new(
        tracker: PipelineTracker,
        queues: PriorityQueueManager,
        health: HealthChecker,
        metrics: MetricsCollector,
        source_gate: Arc<SourceGate>,
        notifier: Arc<dyn OnCallNotifier>,
    ) -> Self {
        Self {
            tracker,
            queues,
            health,
            metrics,
            source_gate,
            notifier,
            last_metrics_collection: None,
            last_report: None,
        }
    }

    fn trigger_on_call(
        &self,
        severity: &str,
        title: String,
        message: String,
        agent_name: Option<String>,
        endpoint_name: Option<String>,
        downtime_seconds: f64,
    ) {
        let alert = OnCallAlert {
            severity: severity.to_string(),
            title,
            message,
            agent_name,
            endpoint_name,
            downtime_seconds,
            created_at: Utc::now(),
        };
        self.notifier.notify(alert);
    }

    async fn run_health_checks(&mut self) {
        let report = self.health.check_all().await;

        for (agent_name, agent) in &report.agents {
            if agent.needs_alert(ON_CALL_ALERT_THRESHOLD_SECS) {
                self.trigger_on_call(
                    "critical",
                    format!("Agent {agent_name} is down"),
                    format!(
                        "Agent {agent_name} has been unhealthy for {:.0} seconds",
                        agent.downtime_seconds()
                    ),
                    Some(agent_name.clone()),
                    None,
                    agent.downtime_seconds(),
                );
            }
        }

        for (endpoint_name, endpoint) in &report.endpoints {
            if endpoint.status == HealthStatus::Unhealthy && endpoint.consecutive_failures >= 3 {
                self.trigger_on_call(
                    "warning",
                    format!("Endpoint {endpoint_name} is unhealthy"),
                    format!(
                        "Endpoint {endpoint_name} has failed {} consecutive health checks",
                        endpoint.consecutive_failures
                    ),
                    None,
                    Some(endpoint_name.clone()),
                    0.0,
                );
            }
        }

        self.last_report = Some(report);
    }

    async fn collect_metrics(&mut self) -> Result<()> {
        let now = Utc::now();
        if let Some(last) = self.last_metrics_collection {
            if (now - last).num_seconds() < METRICS_INTERVAL.as_secs() as i64 {
                return Ok(());
            }
        }
        self.last_metrics_collection = Some(now);

        let depths = self.queues.queue_depths().await?;
        self.metrics.update_queue_depths(&depths).await?;

        let active = self.tracker.active_pipelines().await?.len();
        let snapshot = self.metrics.collect_system_metrics(active).await?;
        self.metrics.store_snapshot(&snapshot).await?;

        Ok(())
    }

    async fn check_stalled(&mut self) -> Result<()> {
        let sweep = self.tracker.sweep_stalled().await?;
        if sweep.stalled > 0 {
            info!(
                stalled = sweep.stalled,
                retried = sweep.retried,
                failed = sweep.failed,
                "stalled pipeline sweep"
            );
        }
        Ok(())
    }

    async fn check_scaling(&mut self) -> Result<()> {
        // Healthy agents approximate the live worker count
        let current_workers = self
            .last_report
            .as_ref()
            .map(|report| {
                report
                    .agents
                    .values()
                    .filter(|a| a.status == HealthStatus::Healthy)
                    .count()
            })
            .unwrap_or(0)
            .max(crate::queues::MIN_WORKERS);

        if let Some(decision) = self.queues.check_scaling(current_workers).await? {
            info!(
                current = decision.current_workers,
                target = decision.target_workers,
                reason = %decision.reason,
                "worker scaling recommended"
            );
            // Acting on the decision is an infrastructure concern
            // (HPA/autoscaler); the orchestrator only emits the signal
        }

        Ok(())
    }

    /// Monitoring loop until shutdown
    pub async fn run(
        &mut self,
        llm: Arc<LlmClient>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("orchestrator monitoring loop starting");

        loop {
            if *shutdown.borrow() {
                break;
            }

            self.run_health_checks().await;

            if let Err(err) = self.collect_metrics().await {
                error!(error = %err, "metrics collection failed");
            }
            if let Err(err) = self.check_stalled().await {
                error!(error = %err, "stalled pipeline sweep failed");
            }
            if let Err(err) = self.check_scaling().await {
                error!(error = %err, "scaling check failed");
            }

            // Surface an opening LLM circuit in the log stream
            let llm_summary = llm.failover().summary();
            if llm_summary.state != grantradar_resilience::CircuitState::Closed {
                warn!(
                    state = ?llm_summary.state,
                    failures = llm_summary.failure_count,
                    "llm circuit is not closed"
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(HEALTH_CHECK_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("orchestrator monitoring loop stopped");
        Ok(())
    }

    /// Comprehensive system status for dashboards and operators
    pub async fn system_status(&mut self, llm: &LlmClient) -> Result<serde_json::Value> {
        let report = self.health.check_all().await;
        let slos = self.metrics.calculate_slos().await?;
        let active = self.tracker.active_pipelines().await?;
        let depths = self.queues.queue_depths().await?;

        let pipeline_details: Vec<serde_json::Value> = active
            .iter()
            .map(|state| {
                json!({
                    "grant_id": state.grant_id,
                    "stage": state.current_stage.as_str(),
                    "priority": state.priority,
                    "latency_seconds": state.total_latency(),
                    "retry_count": state.retry_count,
                })
            })
            .collect();

        let mut circuit_breakers = vec![serde_json::to_value(llm.failover().summary())?];
        for summary in self.source_gate.summaries() {
            circuit_breakers.push(serde_json::to_value(summary)?);
        }

        Ok(json!({
            "timestamp": Utc::now(),
            "health": report,
            "slos": slos,
            "active_pipelines": active.len(),
            "pipeline_details": pipeline_details,
            "queue_depths": depths,
            "circuit_breakers": circuit_breakers,
        }))
    }
}
