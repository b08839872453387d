//! The alert delivery agent
//!
//! Consumes `matches:computed`: enrich from the store, gate on user
//! preferences, derive priority and channels, then either send immediately
//! or batch into the user's daily digest list. One AlertDelivery row is
//! recorded per attempted channel; `(match_id, channel)` is the
//! idempotency key, so redelivered events never double-send a channel
//! whose latest attempt succeeded.

use crate::content::{
    body_prompt, email_html, email_text, fallback_body, fallback_subject, slack_blocks,
    sms_text, subject_prompt,
};
use crate::models::{
    determine_priority, enabled_channels, AlertPayload, AlertPriority, DeliveryChannel, MatchInfo,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use grantradar_events::kv::digest_key;
use grantradar_events::{
    Disposition, EnvelopeHandler, EventBus, KvStore, MatchComputedEvent, MetricsWriter,
    PipelineReporter, StreamMessage, ALERTS_SENT_STREAM,
};
use grantradar_gateways::{
    ChannelResponse, EmailGateway, EmailMessage, LlmClient, SlackGateway, SlackMessage,
    SmsGateway, SmsMessage,
};
use grantradar_storage::{AlertDeliveryRecord, EntityStore, GrantRecord, UserRecord};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Mediums already pending today before further mediums get batched
const MEDIUM_BATCH_THRESHOLD: u64 = 3;

/// Whether an alert goes to the digest instead of immediate delivery.
///
/// Critical always sends now. Daily/weekly digest users batch everything
/// else. Immediate-mode users still batch a medium once they already have
/// a pile of mediums pending today.
fn should_batch(
    priority: AlertPriority,
    digest_frequency: &str,
    pending_mediums_today: u64,
) -> bool {
    match (priority, digest_frequency) {
        (AlertPriority::Critical, _) => false,
        (_, "daily") | (_, "weekly") => true,
        (AlertPriority::Medium, _) => pending_mediums_today >= MEDIUM_BATCH_THRESHOLD,
        _ => false,
    }
}

/// The alert delivery agent
pub struct Alerter {
    bus: EventBus,
    kv: KvStore,
    store: EntityStore,
    email: Arc<EmailGateway>,
    sms: Arc<SmsGateway>,
    slack: Arc<SlackGateway>,
    llm: Arc<LlmClient>,
    reporter: PipelineReporter,
    metrics: MetricsWriter,
    frontend_url: String,
}

impl Alerter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: EventBus,
        kv: KvStore,
        store: EntityStore,
        email: Arc<EmailGateway>,
        sms: Arc<SmsGateway>,
        slack: Arc<SlackGateway>,
        llm: Arc<LlmClient>,
        reporter: PipelineReporter,
        metrics: MetricsWriter,
        frontend_url: String,
    ) -> Self {
        Self {
            bus,
            kv,
            store,
            email,
            sms,
            slack,
            llm,
            reporter,
            metrics,
            frontend_url,
        }
    }

    async fn timed_llm(&self, prompt: &str, max_tokens: u32) -> Result<String> {
        let start = Instant::now();
        let result = self.llm.complete(prompt, Some(max_tokens)).await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;
        if let Err(err) = self.metrics.record_llm_latency(latency_ms).await {
            debug!(error = %err, "llm latency sample dropped");
        }
        result.context("content llm call failed")
    }

    /// Build the email for one match, LLM-authored with template fallback
    async fn build_email(
        &self,
        user: &UserRecord,
        grant: &GrantRecord,
        match_info: &MatchInfo,
    ) -> EmailMessage {
        let subject = match self.timed_llm(&subject_prompt(grant, match_info), 100).await {
            Ok(text) => {
                let cleaned = text.trim().trim_matches('"').to_string();
                if cleaned.is_empty() {
                    fallback_subject(grant, match_info)
                } else {
                    cleaned.chars().take(100).collect()
                }
            }
            Err(err) => {
                warn!(error = %err, "subject generation failed, using template");
                fallback_subject(grant, match_info)
            }
        };

        let body_fragment = match self
            .timed_llm(&body_prompt(user, grant, match_info), 1000)
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => fallback_body(user, grant, match_info),
            Err(err) => {
                warn!(error = %err, "body generation failed, using template");
                fallback_body(user, grant, match_info)
            }
        };

        EmailMessage {
            to_email: user.email.clone(),
            to_name: user.name.clone(),
            subject,
            body_html: email_html(grant, match_info, &body_fragment),
            body_text: email_text(user, grant, &body_fragment),
            tracking_id: Some(match_info.match_id.to_string()),
        }
    }

    async fn send_channel(
        &self,
        channel: DeliveryChannel,
        user: &UserRecord,
        grant: &GrantRecord,
        match_info: &MatchInfo,
    ) -> ChannelResponse {
        match channel {
            DeliveryChannel::Email => {
                let message = self.build_email(user, grant, match_info).await;
                self.email.send(&message).await
            }
            DeliveryChannel::Sms => match &user.phone {
                Some(phone) => {
                    let short_url = format!("{}/g/{}", self.frontend_url, grant.grant_id);
                    let body = sms_text(grant, match_info, &short_url);
                    self.sms
                        .send(&SmsMessage {
                            to: phone.clone(),
                            body,
                        })
                        .await
                }
                None => ChannelResponse::failed("user has no phone number", 0),
            },
            DeliveryChannel::Slack => {
                self.slack
                    .send(&SlackMessage {
                        webhook_url: user.slack_webhook_url.clone(),
                        text: format!(
                            "New {}% grant match: {}",
                            (match_info.match_score * 100.0).round() as i64,
                            grant.title,
                        ),
                        blocks: Some(slack_blocks(grant, match_info)),
                    })
                    .await
            }
        }
    }

    /// Send through every channel, recording one delivery row per attempt.
    pub async fn send_alert(&self, payload: &AlertPayload) -> Result<usize> {
        // Idempotency: skip channels whose latest attempt succeeded
        let previous: HashMap<String, String> = self
            .store
            .deliveries_for_match(payload.match_id)
            .await?
            .into_iter()
            .collect();

        let mut attempted = 0usize;

        for channel in &payload.channels {
            if let Some(status) = previous.get(channel.as_str()) {
                if status == "sent" || status == "delivered" {
                    debug!(
                        match_id = %payload.match_id,
                        channel = channel.as_str(),
                        "channel already delivered, skipping"
                    );
                    continue;
                }
            }

            let response = self
                .send_channel(*channel, &payload.user, &payload.grant, &payload.match_info)
                .await;

            let latency_seconds = match (payload.grant.posted_at, response.sent_at) {
                (Some(posted_at), Some(sent_at)) => {
                    Some((sent_at - posted_at).num_milliseconds() as f64 / 1000.0)
                }
                _ => None,
            };

            let record = AlertDeliveryRecord {
                alert_id: Uuid::new_v4(),
                match_id: payload.match_id,
                channel: channel.as_str().to_string(),
                status: response.status.clone(),
                sent_at: response.sent_at,
                delivered_at: response.delivered_at,
                provider_message_id: response.provider_message_id.clone(),
                retry_count: response.retry_count as i32,
                error_message: response.error_message.clone(),
                latency_seconds,
            };
            self.store.record_delivery(&record).await?;
            attempted += 1;

            self.metrics.record_alert_sent().await?;
            if response.succeeded() {
                self.metrics.record_alert_delivered().await?;
            }

            // Informational stream for dashboards
            let _ = self
                .bus
                .publish(
                    ALERTS_SENT_STREAM,
                    &json!({
                        "match_id": payload.match_id,
                        "user_id": payload.user.user_id,
                        "grant_id": payload.grant.grant_id,
                        "channel": channel.as_str(),
                        "status": response.status,
                        "sent_at": response.sent_at,
                    }),
                )
                .await;

            info!(
                match_id = %payload.match_id,
                channel = channel.as_str(),
                status = %record.status,
                latency_seconds,
                "alert channel attempt recorded"
            );
        }

        Ok(attempted)
    }

    /// Pending medium-priority alerts already batched for the user today
    async fn pending_mediums_today(&self, user_id: Uuid) -> Result<u64> {
        let key = digest_key(&user_id.to_string(), &Utc::now().format("%Y-%m-%d").to_string());
        Ok(self.kv.list_len(&key).await?)
    }

    /// Append the payload to today's digest list, expiring an hour after
    /// end of day.
    pub async fn add_to_digest(&self, payload: &AlertPayload) -> Result<()> {
        let now = Utc::now();
        let date = now.format("%Y-%m-%d").to_string();
        let key = digest_key(&payload.user.user_id.to_string(), &date);

        let end_of_day = now
            .date_naive()
            .and_hms_opt(23, 59, 59)
            .map(|dt| dt.and_utc())
            .unwrap_or(now)
            + ChronoDuration::hours(1);

        self.kv
            .list_push_expire_at(&key, &serde_json::to_string(payload)?, end_of_day)
            .await?;

        info!(
            match_id = %payload.match_id,
            user_id = %payload.user.user_id,
            "alert batched into digest"
        );
        Ok(())
    }

    /// Process one computed-match event
    pub async fn process_match(&self, event: MatchComputedEvent) -> Result<()> {
        // 1. Enrich; a missing record is an expected race, drop quietly
        let Some(user) = self.store.get_user(event.user_id).await? else {
            warn!(user_id = %event.user_id, "user not found, dropping alert");
            return Ok(());
        };
        let Some(grant) = self.store.get_grant(event.grant_id).await? else {
            warn!(grant_id = %event.grant_id, "grant not found, dropping alert");
            return Ok(());
        };

        // 2. Preference gate
        if event.match_score < user.preferences.minimum_match_score {
            debug!(
                match_id = %event.match_id,
                score = event.match_score,
                threshold = user.preferences.minimum_match_score,
                "match below user threshold"
            );
            return Ok(());
        }

        // 3. Priority
        let priority = determine_priority(event.match_score, event.grant_deadline, Utc::now());
        if priority == AlertPriority::Low {
            debug!(match_id = %event.match_id, "low priority, no alert");
            return Ok(());
        }

        // 4. Channels
        let channels = enabled_channels(priority, &user.preferences);
        if channels.is_empty() {
            debug!(
                match_id = %event.match_id,
                user_id = %user.user_id,
                "no channels enabled"
            );
            return Ok(());
        }

        let payload = AlertPayload {
            match_id: event.match_id,
            user,
            grant,
            match_info: MatchInfo {
                match_id: event.match_id,
                match_score: event.match_score,
                matching_criteria: event.matching_criteria.clone().unwrap_or_default(),
                explanation: event.explanation.clone(),
            },
            priority,
            channels,
            created_at: Utc::now(),
        };

        // 5. Route
        let pending_mediums = if priority == AlertPriority::Medium {
            self.pending_mediums_today(payload.user.user_id).await?
        } else {
            0
        };
        let batch = should_batch(
            priority,
            payload.user.preferences.digest_frequency.as_str(),
            pending_mediums,
        );

        if batch {
            self.add_to_digest(&payload).await?;
        } else {
            self.send_alert(&payload).await?;
        }

        // 6. Pipeline bookkeeping
        let total = self.reporter.complete(event.grant_id).await?;
        if total > 0.0 {
            self.metrics
                .record_pipeline_latency("completed", total, Some(&event.grant_id.to_string()))
                .await?;
            self.metrics.record_pipeline_success().await?;
        }
        self.metrics.record_agent_success("delivery").await?;
        self.kv.write_heartbeat("delivery").await?;

        info!(
            match_id = %event.match_id,
            priority = ?priority,
            batched = batch,
            "match event processed"
        );
        Ok(())
    }
}

#[async_trait]
impl EnvelopeHandler for Alerter {
    async fn handle(&self, message: &StreamMessage) -> Disposition {
        let event: MatchComputedEvent = match message.parse() {
            Ok(event) => event,
            Err(err) => {
                return Disposition::DeadLetter {
                    error_type: "EnvelopeParseError".to_string(),
                    message: err.to_string(),
                };
            }
        };

        match self.process_match(event).await {
            Ok(()) => Disposition::Ack,
            Err(err) => {
                if let Err(metrics_err) = self.metrics.record_agent_failure("delivery").await {
                    debug!(error = %metrics_err, "failure counter dropped");
                }
                Disposition::DeadLetter {
                    error_type: "DeliveryError".to_string(),
                    message: format!("{err:#}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn critical_always_sends_immediately() {
        assert!(!should_batch(AlertPriority::Critical, "immediate", 0));
        assert!(!should_batch(AlertPriority::Critical, "daily", 10));
        assert!(!should_batch(AlertPriority::Critical, "weekly", 10));
    }

    #[test]
    fn daily_and_weekly_batch_everything_below_critical() {
        assert!(should_batch(AlertPriority::High, "daily", 0));
        assert!(should_batch(AlertPriority::Medium, "daily", 0));
        assert!(should_batch(AlertPriority::High, "weekly", 0));
        assert!(should_batch(AlertPriority::Medium, "weekly", 0));
    }

    #[test]
    fn immediate_mediums_batch_after_three_pending() {
        // The first three mediums of the day go out immediately
        assert!(!should_batch(AlertPriority::Medium, "immediate", 0));
        assert!(!should_batch(AlertPriority::Medium, "immediate", 2));
        // The fourth joins the digest
        assert!(should_batch(AlertPriority::Medium, "immediate", 3));
        assert!(should_batch(AlertPriority::Medium, "immediate", 7));
    }

    #[test]
    fn immediate_high_never_batches() {
        assert!(!should_batch(AlertPriority::High, "immediate", 10));
    }
}
