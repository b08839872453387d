//! Email delivery channel (SendGrid-style)
//!
//! Success is any 2xx with a provider message id; timeouts, connection
//! errors, 408/429 and 5xx are retried up to three times with 1/2/4 second
//! delays. Other 4xx fail immediately.

use crate::{ChannelResponse, CHANNEL_RETRY_DELAYS};
use grantradar_config::EmailSettings;
use grantradar_resilience::is_retryable_status;
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};
use uuid::Uuid;

/// One email to deliver
#[derive(Debug, Clone)]
pub struct EmailMessage {
    pub to_email: String,
    pub to_name: Option<String>,
    pub subject: String,
    pub body_html: String,
    pub body_text: String,
    /// Correlation id surfaced to the provider; the match id for alerts
    pub tracking_id: Option<String>,
}

/// Email gateway client
pub struct EmailGateway {
    http: reqwest::Client,
    settings: EmailSettings,
    max_attempts: u32,
}

impl EmailGateway {
    pub fn new(settings: &EmailSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            settings: settings.clone(),
            max_attempts: 3,
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.settings.api_key.is_empty()
    }

    fn build_body(&self, message: &EmailMessage) -> serde_json::Value {
        let mut to = json!({"email": message.to_email});
        if let Some(name) = &message.to_name {
            to["name"] = json!(name);
        }

        let mut body = json!({
            "personalizations": [{"to": [to]}],
            "from": {
                "email": self.settings.from_email,
                "name": self.settings.from_name,
            },
            "subject": message.subject,
            "content": [
                {"type": "text/plain", "value": message.body_text},
                {"type": "text/html", "value": message.body_html},
            ],
            "categories": ["grant_alert"],
        });

        if let Some(tracking_id) = &message.tracking_id {
            body["custom_args"] = json!({"match_id": tracking_id});
        }

        body
    }

    /// Send with retries. Always returns a terminal `ChannelResponse`.
    pub async fn send(&self, message: &EmailMessage) -> ChannelResponse {
        let body = self.build_body(message);
        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            let result = self
                .http
                .post(&self.settings.base_url)
                .bearer_auth(&self.settings.api_key)
                .json(&body)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => {
                    let message_id = response
                        .headers()
                        .get("X-Message-Id")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string())
                        .unwrap_or_else(|| Uuid::new_v4().to_string());

                    info!(
                        to = %message.to_email,
                        subject = %truncate(&message.subject, 50),
                        message_id = %message_id,
                        attempt = attempt + 1,
                        "email sent"
                    );
                    return ChannelResponse::sent(message_id, attempt);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    last_error = format!("HTTP {status}");
                    warn!(
                        to = %message.to_email,
                        status,
                        attempt = attempt + 1,
                        "email send attempt failed"
                    );
                    if !is_retryable_status(status) {
                        return ChannelResponse::failed(last_error, attempt + 1);
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(
                        to = %message.to_email,
                        error = %last_error,
                        attempt = attempt + 1,
                        "email send attempt errored"
                    );
                }
            }

            if attempt + 1 < self.max_attempts {
                sleep(Duration::from_secs(
                    CHANNEL_RETRY_DELAYS[attempt as usize % CHANNEL_RETRY_DELAYS.len()],
                ))
                .await;
            }
        }

        ChannelResponse::failed(last_error, self.max_attempts)
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        text
    } else {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(url: String) -> EmailSettings {
        EmailSettings {
            base_url: url,
            api_key: "sg-key".to_string(),
            from_email: "alerts@grantradar.io".to_string(),
            from_name: "GrantRadar".to_string(),
        }
    }

    fn test_message() -> EmailMessage {
        EmailMessage {
            to_email: "researcher@lab.edu".to_string(),
            to_name: Some("Dr. Smith".to_string()),
            subject: "New grant match".to_string(),
            body_html: "<p>match</p>".to_string(),
            body_text: "match".to_string(),
            tracking_id: Some("11111111-2222-3333-4444-555555555555".to_string()),
        }
    }

    #[tokio::test]
    async fn successful_send_returns_message_id() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/send")
            .with_status(202)
            .with_header("X-Message-Id", "sg-abc123")
            .create_async()
            .await;

        let gateway = EmailGateway::new(&test_settings(format!("{}/send", server.url())));
        let response = gateway.send(&test_message()).await;

        assert_eq!(response.status, "sent");
        assert_eq!(response.provider_message_id.as_deref(), Some("sg-abc123"));
        assert_eq!(response.retry_count, 0);
    }

    #[tokio::test]
    async fn server_errors_exhaust_all_attempts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let gateway = EmailGateway::new(&test_settings(format!("{}/send", server.url())));
        let response = gateway.send(&test_message()).await;

        assert_eq!(response.status, "failed");
        assert_eq!(response.error_message.as_deref(), Some("HTTP 503"));
        assert_eq!(response.retry_count, 3);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn client_error_fails_without_retry() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/send")
            .with_status(400)
            .expect(1)
            .create_async()
            .await;

        let gateway = EmailGateway::new(&test_settings(format!("{}/send", server.url())));
        let response = gateway.send(&test_message()).await;

        assert_eq!(response.status, "failed");
        assert_eq!(response.error_message.as_deref(), Some("HTTP 400"));
        mock.assert_async().await;
    }
}
