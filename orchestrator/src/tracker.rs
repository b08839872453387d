//! Stalled-pipeline detection and retry
//!
//! A pipeline is stalled when its current stage started more than 300
//! seconds ago. Stalled pipelines with remaining retries are revived by
//! republishing the stored stage input to that stage's input stream;
//! exhausted ones are marked failed.

use grantradar_events::{EventBus, MetricsWriter, PipelineReporter, PipelineStage, PipelineState};
use tracing::{info, warn};

/// Seconds in one stage before a pipeline counts as stalled
pub const STALL_THRESHOLD_SECS: f64 = 300.0;
/// Retries before a stalled pipeline is failed
pub const MAX_PIPELINE_RETRIES: u32 = 3;

/// Outcome of one stalled-pipeline sweep
#[derive(Debug, Default, Clone)]
pub struct StallSweep {
    pub stalled: usize,
    pub retried: usize,
    pub failed: usize,
}

/// Pipeline tracker driving stall recovery
pub struct PipelineTracker {
    reporter: PipelineReporter,
    bus: EventBus,
    metrics: MetricsWriter,
}

impl PipelineTracker {
    pub fn new(reporter: PipelineReporter, bus: EventBus, metrics: MetricsWriter) -> Self {
        Self {
            reporter,
            bus,
            metrics,
        }
    }

    /// All in-flight pipeline states
    pub async fn active_pipelines(&self) -> anyhow::Result<Vec<PipelineState>> {
        let states = self.reporter.scan_active().await?;
        Ok(states
            .into_iter()
            .filter(|state| {
                !matches!(
                    state.current_stage,
                    PipelineStage::Completed | PipelineStage::Failed
                )
            })
            .collect())
    }

    /// Pipelines stuck in their current stage past the threshold
    pub async fn stalled_pipelines(
        &self,
        threshold_secs: f64,
    ) -> anyhow::Result<Vec<PipelineState>> {
        Ok(self
            .active_pipelines()
            .await?
            .into_iter()
            .filter(|state| state.seconds_in_current_stage() > threshold_secs)
            .collect())
    }

    /// Retry or fail every stalled pipeline.
    pub async fn sweep_stalled(&self) -> anyhow::Result<StallSweep> {
        let stalled = self.stalled_pipelines(STALL_THRESHOLD_SECS).await?;
        let mut sweep = StallSweep {
            stalled: stalled.len(),
            ..Default::default()
        };

        for mut state in stalled {
            warn!(
                grant_id = %state.grant_id,
                stage = state.current_stage.as_str(),
                retry_count = state.retry_count,
                "stalled pipeline detected"
            );

            if state.retry_count >= MAX_PIPELINE_RETRIES {
                self.reporter
                    .fail(state.grant_id, "pipeline stalled after max retries")
                    .await?;
                self.metrics.record_pipeline_failure().await?;
                sweep.failed += 1;
                continue;
            }

            let (Some(stream), Some(input)) = (
                state.current_stage.input_stream(),
                state.stage_input.clone(),
            ) else {
                // No way to replay this stage; give up on the pipeline
                self.reporter
                    .fail(state.grant_id, "stalled with no replayable stage input")
                    .await?;
                self.metrics.record_pipeline_failure().await?;
                sweep.failed += 1;
                continue;
            };

            state.retry_count += 1;
            // Restart the stage clock so the retry gets its full window
            state
                .stage_timestamps
                .insert(state.current_stage.as_str().to_string(), chrono::Utc::now());
            self.reporter.update(&state).await?;

            self.bus.publish(stream, &input).await?;
            sweep.retried += 1;

            info!(
                grant_id = %state.grant_id,
                stage = state.current_stage.as_str(),
                retry = state.retry_count,
                stream,
                "stalled pipeline republished"
            );
        }

        Ok(sweep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn state_in_stage(stage: PipelineStage, entered_secs_ago: i64) -> PipelineState {
        let mut state = PipelineState::new(Uuid::new_v4(), "normal");
        state.current_stage = stage;
        state.stage_timestamps.insert(
            stage.as_str().to_string(),
            Utc::now() - Duration::seconds(entered_secs_ago),
        );
        state
    }

    #[test]
    fn stage_age_detects_stall_threshold() {
        let fresh = state_in_stage(PipelineStage::Matching, 10);
        assert!(fresh.seconds_in_current_stage() < STALL_THRESHOLD_SECS);

        let stalled = state_in_stage(PipelineStage::Matching, 400);
        assert!(stalled.seconds_in_current_stage() > STALL_THRESHOLD_SECS);
    }

    #[test]
    fn retry_budget_is_three() {
        let mut state = state_in_stage(PipelineStage::Matching, 400);
        for _ in 0..MAX_PIPELINE_RETRIES {
            assert!(state.retry_count < MAX_PIPELINE_RETRIES);
            state.retry_count += 1;
        }
        assert_eq!(state.retry_count, MAX_PIPELINE_RETRIES);
    }
}
