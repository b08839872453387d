//! GrantRadar orchestrator
//!
//! Tracks every grant's progress against the 120-second end-to-end target,
//! routes work across priority queues, watches endpoint and agent health,
//! aggregates metrics into SLOs, and pages on-call when the system
//! degrades. Strictly a one-way observer: agents emit heartbeats, pipeline
//! state, and metric samples; the orchestrator reads them.

pub mod coordinator;
pub mod health;
pub mod metrics;
pub mod models;
pub mod queues;
pub mod tracker;

pub use coordinator::{Orchestrator, HEALTH_CHECK_INTERVAL, ON_CALL_ALERT_THRESHOLD_SECS};
pub use health::{HealthChecker, HealthReport, AGENT_NAMES};
pub use metrics::MetricsCollector;
pub use models::{
    AgentHealth, EndpointHealth, HealthStatus, LogNotifier, OnCallAlert, OnCallNotifier,
    SloStatus, SystemMetrics, WorkerScalingDecision,
};
pub use queues::{determine_queue, queue_priority, route_task, PriorityQueueManager, TaskRoute};
pub use tracker::{PipelineTracker, StallSweep, MAX_PIPELINE_RETRIES, STALL_THRESHOLD_SECS};
