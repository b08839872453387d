//! The grant matching engine
//!
//! Consumes `grants:validated` one event at a time. Phase 1 selects up to
//! 50 candidate profiles by cosine similarity above 0.6; phase 2 re-ranks
//! the top 20 through the LLM in batches of 5; phase 3 scores, upserts,
//! and publishes matches whose rounded final score exceeds 70.

use crate::models::{
    compute_final_score, priority_level, rerank_prompt, should_publish, LlmMatchResult,
    FINAL_MATCH_THRESHOLD, LLM_BATCH_SIZE, LLM_RERANK_LIMIT, TOP_CANDIDATES, VECTOR_THRESHOLD,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use grantradar_events::envelope::EVENT_VERSION;
use grantradar_events::{
    Disposition, EnvelopeHandler, EventBus, GrantValidatedEvent, KvStore, MatchComputedEvent,
    MetricsWriter, PipelineReporter, PipelineStage, StreamMessage, MATCHES_STREAM,
};
use grantradar_gateways::{parse_json_response, LlmClient};
use grantradar_storage::{EntityStore, GrantRecord, MatchRecord, ProfileCandidate};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-grant matching statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct MatchingStats {
    pub candidates_found: usize,
    pub llm_evaluated: usize,
    pub matches_stored: usize,
    pub matches_published: usize,
}

/// The matching engine
pub struct GrantMatcher {
    bus: EventBus,
    kv: KvStore,
    store: EntityStore,
    llm: Arc<LlmClient>,
    reporter: PipelineReporter,
    metrics: MetricsWriter,
}

impl GrantMatcher {
    pub fn new(
        bus: EventBus,
        kv: KvStore,
        store: EntityStore,
        llm: Arc<LlmClient>,
        reporter: PipelineReporter,
        metrics: MetricsWriter,
    ) -> Self {
        Self {
            bus,
            kv,
            store,
            llm,
            reporter,
            metrics,
        }
    }

    /// Phase 2: evaluate one batch of candidates through the LLM.
    ///
    /// Results come back keyed by user id; a batch failure is logged and
    /// the rest of the batches proceed.
    async fn evaluate_batch(
        &self,
        grant: &GrantRecord,
        batch: &[ProfileCandidate],
    ) -> Result<Vec<LlmMatchResult>> {
        let prompt = rerank_prompt(grant, batch);

        let start = Instant::now();
        let response = self.llm.complete(&prompt, None).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        if let Err(err) = self.metrics.record_llm_latency(latency_ms).await {
            debug!(error = %err, "llm latency sample dropped");
        }

        let text = response.context("re-rank llm call failed")?;
        parse_json_response::<Vec<LlmMatchResult>>(&text).context("re-rank response parse failed")
    }

    /// Full matching workflow for one validated grant
    pub async fn process_grant(&self, grant_id: Uuid) -> Result<MatchingStats> {
        let mut stats = MatchingStats::default();

        let Some(grant) = self.store.get_grant(grant_id).await? else {
            warn!(%grant_id, "grant not found in store, dropping");
            return Ok(stats);
        };

        let Some(embedding) = grant.embedding.as_deref() else {
            warn!(%grant_id, "grant has no embedding, skipping matching");
            self.reporter.discard(grant_id, "no embedding").await?;
            return Ok(stats);
        };

        // Phase 1: vector candidate selection
        let candidates = self
            .store
            .similar_profiles(embedding, VECTOR_THRESHOLD, TOP_CANDIDATES)
            .await?;
        stats.candidates_found = candidates.len();

        if candidates.is_empty() {
            info!(%grant_id, "no candidate profiles above similarity threshold");
            self.reporter.discard(grant_id, "no candidates").await?;
            return Ok(stats);
        }

        // Phase 2: LLM re-rank of the top candidates, in batches
        let top: Vec<&ProfileCandidate> = candidates.iter().take(LLM_RERANK_LIMIT).collect();
        let mut evaluations: HashMap<Uuid, LlmMatchResult> = HashMap::new();

        for (batch_index, batch) in top.chunks(LLM_BATCH_SIZE).enumerate() {
            let owned: Vec<ProfileCandidate> = batch.iter().map(|c| (*c).clone()).collect();
            match self.evaluate_batch(&grant, &owned).await {
                Ok(results) => {
                    for result in results {
                        evaluations.insert(result.user_id, result);
                    }
                }
                Err(err) => {
                    warn!(
                        %grant_id,
                        batch_index,
                        error = %err,
                        "batch evaluation failed, continuing with remaining batches"
                    );
                }
            }
        }
        stats.llm_evaluated = evaluations.len();

        // Phase 3: score, persist, publish
        let now = Utc::now();
        let mut published_event: Option<MatchComputedEvent> = None;

        for candidate in &top {
            let Some(evaluation) = evaluations.get(&candidate.profile.user_id) else {
                continue;
            };

            let final_score =
                compute_final_score(candidate.vector_similarity, evaluation.match_score);

            // Replay safety: an identical existing row means this event was
            // already processed; re-upserting is harmless but re-publishing
            // would duplicate downstream alerts.
            let existing = self
                .store
                .get_match(grant_id, candidate.profile.user_id)
                .await?;
            let is_replay = existing
                .as_ref()
                .map(|m| (m.final_score - final_score).abs() < f64::EPSILON)
                .unwrap_or(false);

            let record = MatchRecord {
                match_id: existing.map(|m| m.match_id).unwrap_or_else(Uuid::new_v4),
                grant_id,
                user_id: candidate.profile.user_id,
                vector_similarity: candidate.vector_similarity,
                llm_match_score: evaluation.match_score,
                final_score,
                reasoning: evaluation.reasoning.clone(),
                key_strengths: evaluation.key_strengths.clone(),
                concerns: evaluation.concerns.clone(),
                predicted_success: evaluation.predicted_success,
                created_at: now,
            };
            self.store.upsert_match(&record).await?;
            stats.matches_stored += 1;

            if should_publish(final_score) && !is_replay {
                let event = MatchComputedEvent {
                    event_id: Uuid::new_v4(),
                    timestamp: now,
                    version: EVENT_VERSION.to_string(),
                    match_id: record.match_id,
                    grant_id,
                    user_id: record.user_id,
                    match_score: final_score / 100.0,
                    priority_level: priority_level(final_score, grant.deadline, now),
                    matching_criteria: Some(record.key_strengths.clone()),
                    explanation: Some(record.reasoning.clone()),
                    grant_deadline: grant.deadline,
                };
                self.bus.publish(MATCHES_STREAM, &event).await?;
                stats.matches_published += 1;
                published_event = Some(event);

                info!(
                    %grant_id,
                    user_id = %record.user_id,
                    score = final_score,
                    "match published"
                );
            } else {
                debug!(
                    %grant_id,
                    user_id = %record.user_id,
                    score = final_score,
                    threshold = FINAL_MATCH_THRESHOLD,
                    is_replay,
                    "match stored without publishing"
                );
            }
        }

        // Pipeline bookkeeping
        let latency = self
            .reporter
            .transition(grant_id, PipelineStage::Matching, PipelineStage::Matched)
            .await?;
        self.metrics
            .record_pipeline_latency("matched", latency, Some(&grant_id.to_string()))
            .await?;

        if let Some(event) = &published_event {
            self.reporter
                .record_stage_input(grant_id, PipelineStage::Alerting, serde_json::to_value(event)?)
                .await?;
        } else {
            // Nothing for the alerter; the pipeline ends here
            self.reporter
                .discard(grant_id, "no matches above publish threshold")
                .await?;
        }

        self.metrics.record_agent_success("matching").await?;
        self.kv.write_heartbeat("matching").await?;

        info!(
            %grant_id,
            candidates = stats.candidates_found,
            evaluated = stats.llm_evaluated,
            stored = stats.matches_stored,
            published = stats.matches_published,
            "grant matching complete"
        );
        Ok(stats)
    }
}

#[async_trait]
impl EnvelopeHandler for GrantMatcher {
    async fn handle(&self, message: &StreamMessage) -> Disposition {
        let event: GrantValidatedEvent = match message.parse() {
            Ok(event) => event,
            Err(err) => {
                return Disposition::DeadLetter {
                    error_type: "EnvelopeParseError".to_string(),
                    message: err.to_string(),
                };
            }
        };

        match self.process_grant(event.grant_id).await {
            Ok(_) => Disposition::Ack,
            Err(err) => {
                if let Err(metrics_err) = self.metrics.record_agent_failure("matching").await {
                    debug!(error = %metrics_err, "failure counter dropped");
                }
                Disposition::DeadLetter {
                    error_type: "MatchingError".to_string(),
                    message: format!("{err:#}"),
                }
            }
        }
    }
}
