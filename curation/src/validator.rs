//! The curation validator agent
//!
//! One envelope at a time: quality, threshold gate, categories, embedding,
//! dedup, persist, publish, ack. Skips (low quality, confirmed duplicate,
//! already validated) are acked too; only unexpected failures dead-letter.

use crate::categories::{categorization_prompt, derive_keywords, filter_categories};
use crate::dedup::{
    duplicate_prompt, is_duplicate_candidate, merge_duplicate, DuplicateVerdict,
    RecentValidatedGrant,
};
use crate::quality::{rubric_score, validation_prompt, ValidationResult};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use grantradar_events::envelope::EVENT_VERSION;
use grantradar_events::kv::{RECENT_VALIDATED_KEY, RECENT_VALIDATED_LIMIT};
use grantradar_events::{
    Disposition, DiscoveredGrant, EnvelopeHandler, EventBus, GrantValidatedEvent, KvStore,
    MetricsWriter, PipelineReporter, PipelineStage, StreamMessage, ValidationDetails,
    VALIDATED_STREAM,
};
use grantradar_gateways::{parse_json_response, EmbeddingClient, LlmClient};
use grantradar_storage::{EntityStore, GrantRecord, ManualReviewItem};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Embedding input is truncated to this many characters
const EMBED_TEXT_LIMIT: usize = 8000;

/// The curation validator
pub struct CurationValidator {
    bus: EventBus,
    kv: KvStore,
    store: EntityStore,
    llm: Arc<LlmClient>,
    embeddings: Arc<EmbeddingClient>,
    reporter: PipelineReporter,
    metrics: MetricsWriter,
}

impl CurationValidator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        kv: KvStore,
        store: EntityStore,
        llm: Arc<LlmClient>,
        embeddings: Arc<EmbeddingClient>,
        reporter: PipelineReporter,
        metrics: MetricsWriter,
    ) -> Self {
        Self {
            bus,
            kv,
            store,
            llm,
            embeddings,
            reporter,
            metrics,
        }
    }

    /// Initial pipeline priority from deadline proximity
    fn initial_priority(grant: &DiscoveredGrant) -> &'static str {
        match grant.deadline {
            Some(deadline) => {
                let days = (deadline - Utc::now()).num_days();
                if days <= 7 {
                    "critical"
                } else if days <= 30 {
                    "high"
                } else {
                    "normal"
                }
            }
            None => "normal",
        }
    }

    async fn timed_llm(&self, prompt: &str, max_tokens: Option<u32>) -> Result<String> {
        let start = Instant::now();
        let result = self.llm.complete(prompt, max_tokens).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        if let Err(err) = self.metrics.record_llm_latency(latency_ms).await {
            debug!(error = %err, "llm latency sample dropped");
        }
        result.context("llm call failed")
    }

    async fn timed_cached_llm(&self, prompt: &str, max_tokens: Option<u32>) -> Result<String> {
        let start = Instant::now();
        let result = self.llm.complete_cached(prompt, max_tokens).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        if let Err(err) = self.metrics.record_llm_latency(latency_ms).await {
            debug!(error = %err, "llm latency sample dropped");
        }
        result.context("llm call failed")
    }

    /// Quality score via LLM, falling back to the rubric
    async fn validate_quality(&self, grant: &DiscoveredGrant) -> ValidationResult {
        match self.timed_llm(&validation_prompt(grant), Some(512)).await {
            Ok(text) => match parse_json_response::<ValidationResult>(&text) {
                Ok(result) => result,
                Err(err) => {
                    warn!(
                        external_id = %grant.external_id,
                        error = %err,
                        "validation response unparseable, using rubric"
                    );
                    rubric_score(grant, Utc::now())
                }
            },
            Err(err) => {
                warn!(
                    external_id = %grant.external_id,
                    error = %err,
                    "validation llm unavailable, using rubric"
                );
                rubric_score(grant, Utc::now())
            }
        }
    }

    /// Categories via LLM, restricted to the vocabulary; `[Other]` on
    /// failure. Categorization is deterministic over its inputs, so the
    /// cached completion path applies.
    async fn categorize(&self, grant: &DiscoveredGrant) -> Vec<String> {
        let prompt = categorization_prompt(&grant.title, grant.description.as_deref());

        match self.timed_cached_llm(&prompt, Some(256)).await {
            Ok(text) => match parse_json_response::<Vec<String>>(&text) {
                Ok(raw) => filter_categories(raw),
                Err(err) => {
                    warn!(error = %err, "categorization response unparseable");
                    vec!["Other".to_string()]
                }
            },
            Err(err) => {
                warn!(error = %err, "categorization llm unavailable");
                vec!["Other".to_string()]
            }
        }
    }

    /// Embedding over title and description, truncated from the right
    async fn generate_embedding(&self, grant: &DiscoveredGrant) -> Option<Vec<f32>> {
        let mut text = grant.title.clone();
        if let Some(description) = &grant.description {
            text.push(' ');
            text.push_str(description);
        }
        let truncated: String = text.chars().take(EMBED_TEXT_LIMIT).collect();

        match self.embeddings.embed(&truncated).await {
            Ok(vector) => Some(vector),
            Err(err) => {
                warn!(
                    external_id = %grant.external_id,
                    error = %err,
                    "embedding generation failed"
                );
                None
            }
        }
    }

    /// Screen against the recent-validated list, confirming candidates
    /// with the LLM. Returns the confirmed duplicate's slim record.
    async fn find_confirmed_duplicate(
        &self,
        grant: &DiscoveredGrant,
    ) -> Result<Option<RecentValidatedGrant>> {
        let raw_entries = self
            .kv
            .list_range(RECENT_VALIDATED_KEY, RECENT_VALIDATED_LIMIT)
            .await?;

        for raw in raw_entries {
            let Ok(recent) = serde_json::from_str::<RecentValidatedGrant>(&raw) else {
                continue;
            };
            if !is_duplicate_candidate(grant, &recent) {
                continue;
            }

            match self
                .timed_llm(&duplicate_prompt(grant, &recent), Some(64))
                .await
                .and_then(|text| {
                    parse_json_response::<DuplicateVerdict>(&text).context("verdict parse")
                }) {
                Ok(verdict) if verdict.same => {
                    info!(
                        external_id = %grant.external_id,
                        duplicate_of = %recent.grant_id,
                        "duplicate confirmed"
                    );
                    return Ok(Some(recent));
                }
                Ok(_) => continue,
                Err(err) => {
                    // Treat an unavailable confirmation as not-duplicate;
                    // a false negative only costs a redundant grant row
                    warn!(error = %err, "duplicate confirmation failed, keeping grant");
                    continue;
                }
            }
        }

        Ok(None)
    }

    /// Extract a flat eligibility list from whatever the source supplied
    fn eligibility_criteria(grant: &DiscoveredGrant) -> Option<Vec<String>> {
        match &grant.eligibility {
            Some(serde_json::Value::String(text)) => Some(vec![text.clone()]),
            Some(serde_json::Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect(),
            ),
            Some(serde_json::Value::Object(map)) => Some(
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| format!("{k}: {s}")))
                    .collect(),
            ),
            _ => None,
        }
    }

    /// Full processing for one discovered grant
    async fn process(&self, grant: DiscoveredGrant, envelope: serde_json::Value) -> Result<()> {
        // Never publish twice for the same identity
        if let Some(existing) = self
            .store
            .find_grant_id(&grant.source, &grant.external_id)
            .await?
        {
            debug!(
                source = %grant.source,
                external_id = %grant.external_id,
                grant_id = %existing,
                "grant already validated, skipping"
            );
            return Ok(());
        }

        let grant_id = Uuid::new_v4();
        let priority = Self::initial_priority(&grant);
        self.reporter.start(grant_id, priority).await?;
        self.reporter
            .record_stage_input(grant_id, PipelineStage::Validating, envelope)
            .await?;

        // 1. Quality
        let validation = self.validate_quality(&grant).await;

        // 2. Threshold gate
        if !validation.passes_threshold() {
            self.store
                .append_manual_review(&ManualReviewItem {
                    grant_id,
                    reason: "quality_below_threshold".to_string(),
                    quality_score: validation.quality_score,
                    issues: validation.issues.clone(),
                    grant_snapshot: serde_json::to_value(&grant)?,
                    created_at: Utc::now(),
                })
                .await?;
            self.reporter
                .discard(grant_id, "quality below threshold")
                .await?;
            self.metrics.record_agent_success("curation").await?;
            return Ok(());
        }

        // 3. Categories
        let categories = self.categorize(&grant).await;

        // 4. Embedding
        let embedding = self.generate_embedding(&grant).await;
        let embedding_generated = embedding.is_some();

        // 5. Dedup
        if let Some(duplicate_of) = self.find_confirmed_duplicate(&grant).await? {
            if let Some(existing) = self.store.get_grant(duplicate_of.grant_id).await? {
                let merged = merge_duplicate(existing, &grant);
                self.store.upsert_grant(&merged).await?;
            }
            self.reporter
                .discard(grant_id, "merged into existing grant")
                .await?;
            self.metrics.record_agent_success("curation").await?;
            return Ok(());
        }

        // 6. Persist and publish
        let now = Utc::now();
        let keywords = derive_keywords(&grant.title, &categories);
        let record = GrantRecord {
            grant_id,
            source: grant.source.clone(),
            sources: vec![grant.source.clone()],
            external_id: grant.external_id.clone(),
            title: grant.title.clone(),
            description: grant.description.clone(),
            url: grant.url.clone(),
            funding_agency: grant.funding_agency.clone(),
            amount_min: grant.amount_min,
            amount_max: grant.amount_max.or(grant.estimated_amount),
            deadline: grant.deadline,
            eligibility: grant.eligibility.clone(),
            categories: categories.clone(),
            keywords: keywords.clone(),
            quality_score: validation.quality_score,
            confidence_score: 1.0,
            embedding,
            posted_at: Some(grant.discovered_at),
            discovered_at: grant.discovered_at,
            validated_at: now,
        };
        self.store.upsert_grant(&record).await?;

        let event = GrantValidatedEvent {
            event_id: Uuid::new_v4(),
            timestamp: now,
            version: EVENT_VERSION.to_string(),
            grant_id,
            quality_score: validation.quality_score / 100.0,
            categories,
            embedding_generated,
            validation_details: ValidationDetails {
                confidence_score: record.confidence_score,
                validated_at: now,
            },
            eligibility_criteria: Self::eligibility_criteria(&grant),
            keywords: Some(keywords),
        };
        self.bus.publish(VALIDATED_STREAM, &event).await?;

        // 7. Feed the cheap dedup screen
        let recent = RecentValidatedGrant::from_record(&record);
        self.kv
            .list_push_trim(
                RECENT_VALIDATED_KEY,
                &serde_json::to_string(&recent)?,
                RECENT_VALIDATED_LIMIT,
            )
            .await?;

        // 8. Pipeline bookkeeping, one-way
        let latency = self
            .reporter
            .transition(grant_id, PipelineStage::Validating, PipelineStage::Validated)
            .await?;
        self.metrics
            .record_pipeline_latency("validated", latency, Some(&grant_id.to_string()))
            .await?;
        self.reporter
            .record_stage_input(grant_id, PipelineStage::Matching, serde_json::to_value(&event)?)
            .await?;
        self.metrics.record_agent_success("curation").await?;
        self.kv.write_heartbeat("curation").await?;

        info!(
            %grant_id,
            source = %grant.source,
            external_id = %grant.external_id,
            quality = validation.quality_score,
            embedding_generated,
            "grant validated and published"
        );
        Ok(())
    }
}

#[async_trait]
impl EnvelopeHandler for CurationValidator {
    async fn handle(&self, message: &StreamMessage) -> Disposition {
        let grant: DiscoveredGrant = match message.parse() {
            Ok(grant) => grant,
            Err(err) => {
                return Disposition::DeadLetter {
                    error_type: "EnvelopeParseError".to_string(),
                    message: err.to_string(),
                };
            }
        };

        match self.process(grant, message.as_value()).await {
            Ok(()) => Disposition::Ack,
            Err(err) => {
                if let Err(metrics_err) = self.metrics.record_agent_failure("curation").await {
                    debug!(error = %metrics_err, "failure counter dropped");
                }
                Disposition::DeadLetter {
                    error_type: "ValidationError".to_string(),
                    message: format!("{err:#}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant_with_deadline(days: i64) -> DiscoveredGrant {
        DiscoveredGrant {
            source: "nih".to_string(),
            external_id: "R01-CA-1".to_string(),
            title: "Novel targeted therapy in cancer".to_string(),
            description: Some("details".to_string()),
            url: "https://example.org".to_string(),
            funding_agency: None,
            estimated_amount: None,
            amount_min: None,
            amount_max: None,
            deadline: Some(Utc::now() + Duration::days(days)),
            eligibility: None,
            discovered_at: Utc::now(),
            raw_data: None,
        }
    }

    #[test]
    fn initial_priority_tracks_deadline_proximity() {
        assert_eq!(
            CurationValidator::initial_priority(&grant_with_deadline(5)),
            "critical"
        );
        assert_eq!(
            CurationValidator::initial_priority(&grant_with_deadline(20)),
            "high"
        );
        assert_eq!(
            CurationValidator::initial_priority(&grant_with_deadline(90)),
            "normal"
        );

        let mut no_deadline = grant_with_deadline(5);
        no_deadline.deadline = None;
        assert_eq!(
            CurationValidator::initial_priority(&no_deadline),
            "normal"
        );
    }

    #[test]
    fn eligibility_extraction_handles_all_shapes() {
        let mut grant = grant_with_deadline(30);

        grant.eligibility = Some(serde_json::json!("Nonprofits only"));
        assert_eq!(
            CurationValidator::eligibility_criteria(&grant),
            Some(vec!["Nonprofits only".to_string()])
        );

        grant.eligibility = Some(serde_json::json!(["Universities", "Hospitals"]));
        assert_eq!(
            CurationValidator::eligibility_criteria(&grant),
            Some(vec!["Universities".to_string(), "Hospitals".to_string()])
        );

        grant.eligibility = Some(serde_json::json!({"applicant_types": "R1 universities"}));
        assert_eq!(
            CurationValidator::eligibility_criteria(&grant),
            Some(vec!["applicant_types: R1 universities".to_string()])
        );

        grant.eligibility = None;
        assert_eq!(CurationValidator::eligibility_criteria(&grant), None);
    }
}
