//! Digest processing
//!
//! A scheduled job invokes the processor at end of day. Each user's
//! pending list becomes one email: up to ten items sorted by descending
//! score, an LLM-written intro (fixed greeting on failure), and the list
//! is deleted once the email is sent.

use crate::content::{digest_entry_html, digest_intro_fallback, digest_intro_prompt};
use crate::models::AlertPayload;
use anyhow::Result;
use chrono::Utc;
use grantradar_events::kv::digest_key;
use grantradar_events::{KvStore, MetricsWriter};
use grantradar_gateways::{EmailGateway, EmailMessage, LlmClient};
use grantradar_storage::{AlertDeliveryRecord, EntityStore};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Items included per digest email
pub const DIGEST_ITEM_LIMIT: usize = 10;

/// End-of-day digest processor
pub struct DigestProcessor {
    kv: KvStore,
    store: EntityStore,
    email: Arc<EmailGateway>,
    llm: Arc<LlmClient>,
    metrics: MetricsWriter,
}

impl DigestProcessor {
    pub fn new(
        kv: KvStore,
        store: EntityStore,
        email: Arc<EmailGateway>,
        llm: Arc<LlmClient>,
        metrics: MetricsWriter,
    ) -> Self {
        Self {
            kv,
            store,
            email,
            llm,
            metrics,
        }
    }

    /// Compose and send one user's digest for the given date. Returns the
    /// number of items included.
    pub async fn process_user(&self, user_id: Uuid, date: &str) -> Result<usize> {
        let key = digest_key(&user_id.to_string(), date);
        let raw_entries = self.kv.list_range(&key, 1000).await?;

        let mut payloads: Vec<AlertPayload> = raw_entries
            .iter()
            .filter_map(|raw| serde_json::from_str(raw).ok())
            .collect();

        if payloads.is_empty() {
            return Ok(0);
        }

        payloads.sort_by(|a, b| {
            b.match_info
                .match_score
                .partial_cmp(&a.match_info.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let total = payloads.len();
        payloads.truncate(DIGEST_ITEM_LIMIT);

        let user = payloads[0].user.clone();

        let intro = match self
            .llm
            .complete(&digest_intro_prompt(&user, &payloads), Some(200))
            .await
        {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => digest_intro_fallback(&user, total),
            Err(err) => {
                warn!(error = %err, "digest intro generation failed, using greeting");
                digest_intro_fallback(&user, total)
            }
        };

        let subject = if total == 1 {
            format!(
                "GrantRadar: New grant match ({}%)",
                (payloads[0].match_info.match_score * 100.0).round() as i64
            )
        } else {
            format!("GrantRadar: {total} new grant matches for you")
        };

        let entries_html: String = payloads.iter().map(digest_entry_html).collect();
        let overflow_note = if total > DIGEST_ITEM_LIMIT {
            format!(
                "<p style=\"color: #6b7280; font-style: italic;\">Showing top {DIGEST_ITEM_LIMIT} \
                 of {total} matches. View all in your dashboard.</p>"
            )
        } else {
            String::new()
        };

        let body_html = format!(
            "<html><body style=\"font-family: sans-serif; color: #333;\">\
             <h1>Your Grant Digest</h1><p>{intro}</p>{entries_html}{overflow_note}\
             </body></html>"
        );

        let mut body_text = format!("{intro}\n\nYOUR MATCHES\n============\n\n");
        for (i, payload) in payloads.iter().enumerate() {
            body_text.push_str(&format!(
                "{}. {} - {}% match\n   View: {}\n",
                i + 1,
                payload.grant.title,
                (payload.match_info.match_score * 100.0).round() as i64,
                payload.grant.url,
            ));
        }

        let message = EmailMessage {
            to_email: user.email.clone(),
            to_name: user.name.clone(),
            subject,
            body_html,
            body_text,
            tracking_id: Some(payloads[0].match_id.to_string()),
        };

        let response = self.email.send(&message).await;

        // One delivery row per included match so redeliveries of the same
        // computed events see them as handled
        for payload in &payloads {
            let record = AlertDeliveryRecord {
                alert_id: Uuid::new_v4(),
                match_id: payload.match_id,
                channel: "email".to_string(),
                status: response.status.clone(),
                sent_at: response.sent_at,
                delivered_at: response.delivered_at,
                provider_message_id: response.provider_message_id.clone(),
                retry_count: response.retry_count as i32,
                error_message: response.error_message.clone(),
                latency_seconds: None,
            };
            self.store.record_delivery(&record).await?;
            self.metrics.record_alert_sent().await?;
            if response.succeeded() {
                self.metrics.record_alert_delivered().await?;
            }
        }

        self.kv.delete(&key).await?;

        info!(
            %user_id,
            included = payloads.len(),
            total,
            status = %response.status,
            "digest sent"
        );
        Ok(payloads.len())
    }

    /// Process every pending digest for a date. Returns processed users.
    pub async fn process_all_due(&self, date: &str) -> Result<usize> {
        let pattern = format!("digest:pending:*:{date}");
        let keys = self.kv.scan_keys(&pattern).await?;

        let mut processed = 0usize;
        for key in keys {
            // Key layout: digest:pending:<user_id>:<date>
            let Some(user_id) = key
                .split(':')
                .nth(2)
                .and_then(|raw| Uuid::parse_str(raw).ok())
            else {
                warn!(%key, "skipping malformed digest key");
                continue;
            };

            match self.process_user(user_id, date).await {
                Ok(count) if count > 0 => processed += 1,
                Ok(_) => {}
                Err(err) => warn!(%user_id, error = %err, "digest processing failed"),
            }
        }

        info!(date, processed, "digest sweep complete");
        Ok(processed)
    }

    /// Today's digest date component
    pub fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::models::{AlertPayload, AlertPriority, DeliveryChannel, MatchInfo};
    use chrono::Utc;
    use grantradar_storage::{GrantRecord, NotificationPreferences, UserRecord};
    use uuid::Uuid;

    fn payload(score: f64) -> AlertPayload {
        let user = UserRecord {
            user_id: Uuid::new_v4(),
            name: Some("Dr. Smith".to_string()),
            email: "smith@lab.edu".to_string(),
            phone: None,
            slack_webhook_url: None,
            preferences: NotificationPreferences::default(),
        };
        let grant = GrantRecord {
            grant_id: Uuid::new_v4(),
            source: "nih".to_string(),
            sources: vec!["nih".to_string()],
            external_id: Uuid::new_v4().to_string(),
            title: format!("Grant at {score}"),
            description: None,
            url: "https://example.org".to_string(),
            funding_agency: None,
            amount_min: None,
            amount_max: None,
            deadline: None,
            eligibility: None,
            categories: vec![],
            keywords: vec![],
            quality_score: 90.0,
            confidence_score: 1.0,
            embedding: None,
            posted_at: None,
            discovered_at: Utc::now(),
            validated_at: Utc::now(),
        };
        AlertPayload {
            match_id: Uuid::new_v4(),
            user,
            grant,
            match_info: MatchInfo {
                match_id: Uuid::new_v4(),
                match_score: score,
                matching_criteria: vec![],
                explanation: None,
            },
            priority: AlertPriority::Medium,
            channels: vec![DeliveryChannel::Email],
            created_at: Utc::now(),
        }
    }

    #[test]
    fn payloads_sort_by_descending_score() {
        let mut payloads = vec![payload(0.72), payload(0.91), payload(0.84)];
        payloads.sort_by(|a, b| {
            b.match_info
                .match_score
                .partial_cmp(&a.match_info.match_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let scores: Vec<f64> = payloads.iter().map(|p| p.match_info.match_score).collect();
        assert_eq!(scores, vec![0.91, 0.84, 0.72]);
    }

    #[test]
    fn payload_round_trips_through_digest_list_encoding() {
        let original = payload(0.88);
        let encoded = serde_json::to_string(&original).unwrap();
        let decoded: AlertPayload = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded.match_id, original.match_id);
        assert_eq!(decoded.match_info.match_score, 0.88);
        assert_eq!(decoded.channels, vec![DeliveryChannel::Email]);
    }
}
