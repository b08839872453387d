//! Pipeline stage tracking
//!
//! One `PipelineState` record per in-flight grant, keyed by
//! `pipeline:state:<grant_id>` with a 1 hour TTL (24 hours once failed).
//! Agents report transitions through `PipelineReporter`; the orchestrator
//! only reads these records. Agents never call into the orchestrator.

use crate::bus::BusError;
use crate::kv::KvStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, error, info};
use uuid::Uuid;

/// TTL for healthy pipeline records
pub const HEALTHY_TTL_SECS: u64 = 3600;
/// TTL for failed pipeline records, kept longer for inspection
pub const FAILED_TTL_SECS: u64 = 86_400;

/// Per-stage latency targets in seconds
pub const VALIDATION_TARGET_SECS: f64 = 30.0;
pub const MATCHING_TARGET_SECS: f64 = 60.0;
pub const ALERTING_TARGET_SECS: f64 = 30.0;
/// End-to-end latency SLO in seconds
pub const TOTAL_TARGET_SECS: f64 = 120.0;

/// Stages in the grant processing pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineStage {
    Discovered,
    Validating,
    Validated,
    Matching,
    Matched,
    Alerting,
    Completed,
    Failed,
}

impl PipelineStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Discovered => "discovered",
            PipelineStage::Validating => "validating",
            PipelineStage::Validated => "validated",
            PipelineStage::Matching => "matching",
            PipelineStage::Matched => "matched",
            PipelineStage::Alerting => "alerting",
            PipelineStage::Completed => "completed",
            PipelineStage::Failed => "failed",
        }
    }

    /// The stream feeding work into this stage, used when a stalled
    /// pipeline is retried by republishing.
    pub fn input_stream(&self) -> Option<&'static str> {
        match self {
            PipelineStage::Validating => Some(crate::envelope::DISCOVERED_STREAM),
            PipelineStage::Matching => Some(crate::envelope::VALIDATED_STREAM),
            PipelineStage::Alerting => Some(crate::envelope::MATCHES_STREAM),
            _ => None,
        }
    }
}

/// A grant's progress through the pipeline.
///
/// Stage transitions are monotonic except for `Failed`; each agent reads
/// the authoritative record from the store before acting, so per-grant
/// ordering holds without stream-level ordering guarantees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub grant_id: Uuid,
    pub current_stage: PipelineStage,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub stage_timestamps: HashMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub latencies: HashMap<String, f64>,
    pub priority: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub error_message: Option<String>,
    /// The envelope that entered the current stage, republished on stall
    #[serde(default)]
    pub stage_input: Option<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineState {
    pub fn new(grant_id: Uuid, priority: &str) -> Self {
        let now = Utc::now();
        let mut stage_timestamps = HashMap::new();
        stage_timestamps.insert(PipelineStage::Discovered.as_str().to_string(), now);

        Self {
            grant_id,
            current_stage: PipelineStage::Discovered,
            started_at: now,
            stage_timestamps,
            latencies: HashMap::new(),
            priority: priority.to_string(),
            retry_count: 0,
            error_message: None,
            stage_input: None,
            metadata: HashMap::new(),
        }
    }

    /// Record a stage transition. Returns the latency of the completed
    /// stage in seconds (0.0 when the from-stage was never entered).
    pub fn record_stage_transition(
        &mut self,
        from_stage: PipelineStage,
        to_stage: PipelineStage,
    ) -> f64 {
        let now = Utc::now();
        let latency = self
            .stage_timestamps
            .get(from_stage.as_str())
            .map(|entered| (now - *entered).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0);

        if latency > 0.0 {
            self.latencies.insert(from_stage.as_str().to_string(), latency);
        }
        self.stage_timestamps
            .insert(to_stage.as_str().to_string(), now);
        self.current_stage = to_stage;

        latency
    }

    /// Total time since the pipeline started, in seconds
    pub fn total_latency(&self) -> f64 {
        (Utc::now() - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Seconds spent in the current stage
    pub fn seconds_in_current_stage(&self) -> f64 {
        self.stage_timestamps
            .get(self.current_stage.as_str())
            .map(|entered| (Utc::now() - *entered).num_milliseconds() as f64 / 1000.0)
            .unwrap_or(0.0)
    }
}

/// Redis key for a grant's pipeline state
pub fn pipeline_key(grant_id: Uuid) -> String {
    format!("pipeline:state:{grant_id}")
}

/// Writes pipeline state transitions on behalf of the agents.
#[derive(Clone)]
pub struct PipelineReporter {
    kv: KvStore,
}

impl PipelineReporter {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    async fn save(&self, state: &PipelineState, ttl_secs: u64) -> Result<(), BusError> {
        let json = serde_json::to_string(state)?;
        self.kv
            .set_string_ex(&pipeline_key(state.grant_id), &json, ttl_secs)
            .await
    }

    /// Load a grant's pipeline state if it is still tracked
    pub async fn load(&self, grant_id: Uuid) -> Result<Option<PipelineState>, BusError> {
        let raw = self.kv.get_string(&pipeline_key(grant_id)).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json).ok()),
            None => Ok(None),
        }
    }

    /// Start tracking a new pipeline
    pub async fn start(&self, grant_id: Uuid, priority: &str) -> Result<PipelineState, BusError> {
        let state = PipelineState::new(grant_id, priority);
        self.save(&state, HEALTHY_TTL_SECS).await?;
        info!(%grant_id, priority, "pipeline started");
        Ok(state)
    }

    /// Record a stage transition, creating the state if it was never
    /// started (a grant may enter mid-pipeline after a restart).
    pub async fn transition(
        &self,
        grant_id: Uuid,
        from_stage: PipelineStage,
        to_stage: PipelineStage,
    ) -> Result<f64, BusError> {
        let mut state = match self.load(grant_id).await? {
            Some(state) => state,
            None => PipelineState::new(grant_id, "normal"),
        };

        let latency = state.record_stage_transition(from_stage, to_stage);
        self.save(&state, HEALTHY_TTL_SECS).await?;

        debug!(
            %grant_id,
            from = from_stage.as_str(),
            to = to_stage.as_str(),
            latency_secs = latency,
            "pipeline stage transition"
        );

        Ok(latency)
    }

    /// Store the envelope that entered the given stage so a stalled
    /// pipeline can be retried by republishing it.
    pub async fn record_stage_input(
        &self,
        grant_id: Uuid,
        stage: PipelineStage,
        envelope: serde_json::Value,
    ) -> Result<(), BusError> {
        if let Some(mut state) = self.load(grant_id).await? {
            state.current_stage = stage;
            state
                .stage_timestamps
                .entry(stage.as_str().to_string())
                .or_insert_with(Utc::now);
            state.stage_input = Some(envelope);
            self.save(&state, HEALTHY_TTL_SECS).await?;
        }
        Ok(())
    }

    /// Complete the pipeline. Returns total latency; the record is removed.
    pub async fn complete(&self, grant_id: Uuid) -> Result<f64, BusError> {
        let total = match self.load(grant_id).await? {
            Some(mut state) => {
                state.record_stage_transition(PipelineStage::Alerting, PipelineStage::Completed);
                let total = state.total_latency();
                if total > TOTAL_TARGET_SECS {
                    tracing::warn!(
                        %grant_id,
                        total_secs = total,
                        target_secs = TOTAL_TARGET_SECS,
                        "pipeline exceeded end-to-end target"
                    );
                }
                total
            }
            None => 0.0,
        };

        self.kv.delete(&pipeline_key(grant_id)).await?;
        info!(%grant_id, total_secs = total, "pipeline completed");
        Ok(total)
    }

    /// Stop tracking a pipeline that ended deliberately before completion
    /// (manual-review sideline, duplicate merge). Not a failure.
    pub async fn discard(&self, grant_id: Uuid, reason: &str) -> Result<(), BusError> {
        self.kv.delete(&pipeline_key(grant_id)).await?;
        debug!(%grant_id, reason, "pipeline discarded");
        Ok(())
    }

    /// Mark the pipeline failed, keeping the record for 24 hours.
    pub async fn fail(&self, grant_id: Uuid, error_message: &str) -> Result<(), BusError> {
        let mut state = match self.load(grant_id).await? {
            Some(state) => state,
            None => PipelineState::new(grant_id, "normal"),
        };

        state.current_stage = PipelineStage::Failed;
        state.error_message = Some(error_message.to_string());
        self.save(&state, FAILED_TTL_SECS).await?;
        error!(%grant_id, error = error_message, "pipeline failed");
        Ok(())
    }

    /// Persist a modified state back (used by the orchestrator after
    /// bumping retry counts).
    pub async fn update(&self, state: &PipelineState) -> Result<(), BusError> {
        let ttl = if state.current_stage == PipelineStage::Failed {
            FAILED_TTL_SECS
        } else {
            HEALTHY_TTL_SECS
        };
        self.save(state, ttl).await
    }

    /// All tracked pipeline states
    pub async fn scan_active(&self) -> Result<Vec<PipelineState>, BusError> {
        let keys = self.kv.scan_keys("pipeline:state:*").await?;
        let mut states = Vec::with_capacity(keys.len());

        for key in keys {
            if let Some(json) = self.kv.get_string(&key).await? {
                if let Ok(state) = serde_json::from_str::<PipelineState>(&json) {
                    states.push(state);
                }
            }
        }

        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_state_starts_at_discovered() {
        let state = PipelineState::new(Uuid::new_v4(), "high");
        assert_eq!(state.current_stage, PipelineStage::Discovered);
        assert_eq!(state.priority, "high");
        assert!(state
            .stage_timestamps
            .contains_key(PipelineStage::Discovered.as_str()));
    }

    #[test]
    fn transition_records_latency_and_advances_stage() {
        let mut state = PipelineState::new(Uuid::new_v4(), "normal");
        state.record_stage_transition(PipelineStage::Discovered, PipelineStage::Validating);
        assert_eq!(state.current_stage, PipelineStage::Validating);

        let latency =
            state.record_stage_transition(PipelineStage::Validating, PipelineStage::Validated);
        assert!(latency >= 0.0);
        assert_eq!(state.current_stage, PipelineStage::Validated);
    }

    #[test]
    fn transition_from_unvisited_stage_yields_zero_latency() {
        let mut state = PipelineState::new(Uuid::new_v4(), "normal");
        let latency =
            state.record_stage_transition(PipelineStage::Matching, PipelineStage::Matched);
        assert_eq!(latency, 0.0);
        assert_eq!(state.current_stage, PipelineStage::Matched);
    }

    #[test]
    fn stage_input_streams_map_to_consumed_streams() {
        assert_eq!(
            PipelineStage::Validating.input_stream(),
            Some("grants:discovered")
        );
        assert_eq!(
            PipelineStage::Matching.input_stream(),
            Some("grants:validated")
        );
        assert_eq!(
            PipelineStage::Alerting.input_stream(),
            Some("matches:computed")
        );
        assert_eq!(PipelineStage::Completed.input_stream(), None);
    }

    #[test]
    fn state_round_trips_through_json() {
        let mut state = PipelineState::new(Uuid::new_v4(), "critical");
        state.record_stage_transition(PipelineStage::Discovered, PipelineStage::Validating);
        state.stage_input = Some(serde_json::json!({"grant_id": state.grant_id}));

        let json = serde_json::to_string(&state).unwrap();
        let parsed: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.current_stage, PipelineStage::Validating);
        assert_eq!(parsed.priority, "critical");
        assert!(parsed.stage_input.is_some());
    }
}
