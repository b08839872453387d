//! Provider delivery-event tracking
//!
//! Email and SMS providers report final delivery state asynchronously via
//! webhooks. These handlers parse the callback payloads and update the
//! matching AlertDelivery row by provider message id. The HTTP surface
//! that receives the callbacks lives outside the pipeline; it hands the
//! raw payloads here.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use grantradar_storage::EntityStore;
use serde::Deserialize;
use tracing::{debug, info, warn};

/// One email provider webhook event
#[derive(Debug, Clone, Deserialize)]
pub struct EmailEvent {
    pub event: String,
    #[serde(default)]
    pub sg_message_id: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

impl EmailEvent {
    fn occurred_at(&self) -> Option<DateTime<Utc>> {
        self.timestamp
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
    }

    /// Provider message ids arrive suffixed with a routing segment
    /// (`<id>.filterNNN...`); only the leading segment matches what the
    /// send response reported.
    fn message_id(&self) -> Option<&str> {
        self.sg_message_id
            .as_deref()
            .map(|id| id.split('.').next().unwrap_or(id))
    }
}

/// SMS status callback fields
#[derive(Debug, Clone, Deserialize)]
pub struct SmsStatusCallback {
    #[serde(rename = "MessageSid")]
    pub message_sid: String,
    #[serde(rename = "MessageStatus")]
    pub message_status: String,
    #[serde(rename = "ErrorCode", default)]
    pub error_code: Option<String>,
}

/// Applies provider callbacks to the delivery records
pub struct DeliveryTracker {
    store: EntityStore,
}

impl DeliveryTracker {
    pub fn new(store: EntityStore) -> Self {
        Self { store }
    }

    /// Handle one email provider event. Only terminal events mutate the
    /// record; opens and clicks are logged for analytics.
    pub async fn handle_email_event(&self, event: &EmailEvent) -> Result<bool> {
        let Some(message_id) = event.message_id() else {
            warn!(event = %event.event, "email event without message id");
            return Ok(false);
        };

        let updated = match event.event.as_str() {
            "delivered" => {
                self.store
                    .update_delivery_status(message_id, "delivered", event.occurred_at())
                    .await?
            }
            "bounce" | "dropped" | "spamreport" => {
                self.store
                    .update_delivery_status(message_id, "failed", None)
                    .await?
            }
            other => {
                debug!(event = other, message_id, "email event recorded without status change");
                false
            }
        };

        if updated {
            info!(
                event = %event.event,
                message_id,
                email = event.email.as_deref().unwrap_or(""),
                "email delivery status updated"
            );
        }
        Ok(updated)
    }

    /// Handle one SMS status callback.
    pub async fn handle_sms_status(&self, callback: &SmsStatusCallback) -> Result<bool> {
        let (status, delivered_at) = match callback.message_status.as_str() {
            "delivered" => ("delivered", Some(Utc::now())),
            "undelivered" | "failed" => ("failed", None),
            other => {
                debug!(status = other, sid = %callback.message_sid, "intermediate sms status");
                return Ok(false);
            }
        };

        let updated = self
            .store
            .update_delivery_status(&callback.message_sid, status, delivered_at)
            .await?;

        if updated {
            info!(
                sid = %callback.message_sid,
                status,
                error_code = callback.error_code.as_deref().unwrap_or(""),
                "sms delivery status updated"
            );
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_event_parses_provider_payload() {
        let event: EmailEvent = serde_json::from_str(
            r#"{"event": "delivered", "sg_message_id": "sg-abc.filter001.123",
                "email": "smith@lab.edu", "timestamp": 1767225600}"#,
        )
        .unwrap();

        assert_eq!(event.event, "delivered");
        assert_eq!(event.message_id(), Some("sg-abc"));
        assert!(event.occurred_at().is_some());
    }

    #[test]
    fn message_id_without_suffix_passes_through() {
        let event: EmailEvent =
            serde_json::from_str(r#"{"event": "open", "sg_message_id": "sg-xyz"}"#).unwrap();
        assert_eq!(event.message_id(), Some("sg-xyz"));
        assert!(event.occurred_at().is_none());
    }

    #[test]
    fn sms_callback_parses_form_field_names() {
        let callback: SmsStatusCallback = serde_json::from_str(
            r#"{"MessageSid": "SM_abc", "MessageStatus": "delivered"}"#,
        )
        .unwrap();
        assert_eq!(callback.message_sid, "SM_abc");
        assert_eq!(callback.message_status, "delivered");
        assert!(callback.error_code.is_none());
    }

    #[test]
    fn sms_error_callback_carries_code() {
        let callback: SmsStatusCallback = serde_json::from_str(
            r#"{"MessageSid": "SM_x", "MessageStatus": "undelivered", "ErrorCode": "30003"}"#,
        )
        .unwrap();
        assert_eq!(callback.error_code.as_deref(), Some("30003"));
    }
}
