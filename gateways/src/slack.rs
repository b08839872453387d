//! Slack webhook delivery channel
//!
//! Success is HTTP 200 with body `ok`. Rate limiting honors `Retry-After`;
//! other 4xx are never retried; 5xx and transport errors retry up to three
//! times with 1/2/4 second delays.

use crate::{ChannelResponse, CHANNEL_RETRY_DELAYS};
use serde_json::json;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// One Slack message to deliver
#[derive(Debug, Clone)]
pub struct SlackMessage {
    /// Per-user incoming webhook; falls back to the system default
    pub webhook_url: Option<String>,
    /// Plain-text fallback shown in notifications
    pub text: String,
    /// Optional Block Kit blocks
    pub blocks: Option<serde_json::Value>,
}

/// Slack gateway client
pub struct SlackGateway {
    http: reqwest::Client,
    default_webhook_url: Option<String>,
    max_attempts: u32,
}

impl SlackGateway {
    pub fn new(default_webhook_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            default_webhook_url,
            max_attempts: 3,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.default_webhook_url.is_some()
    }

    /// Send a message, retrying transient failures.
    pub async fn send(&self, message: &SlackMessage) -> ChannelResponse {
        let webhook_url = match message
            .webhook_url
            .as_ref()
            .or(self.default_webhook_url.as_ref())
        {
            Some(url) => url.clone(),
            None => return ChannelResponse::failed("no slack webhook url configured", 0),
        };

        let mut payload = json!({"text": message.text});
        if let Some(blocks) = &message.blocks {
            payload["blocks"] = blocks.clone();
        }

        let mut last_error = String::new();

        for attempt in 0..self.max_attempts {
            let result = self.http.post(&webhook_url).json(&payload).send().await;

            match result {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = response
                        .headers()
                        .get("Retry-After")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok());
                    let body = response.text().await.unwrap_or_default();

                    if status == 200 && body == "ok" {
                        info!(attempt = attempt + 1, "slack message delivered");
                        return ChannelResponse::delivered(attempt);
                    }

                    last_error = format!("slack error (HTTP {status}): {body}");

                    if status == 429 {
                        let wait = retry_after.unwrap_or(
                            CHANNEL_RETRY_DELAYS[attempt as usize % CHANNEL_RETRY_DELAYS.len()],
                        );
                        warn!(retry_after = wait, attempt = attempt + 1, "slack rate limited");
                        if attempt + 1 < self.max_attempts {
                            sleep(Duration::from_secs(wait)).await;
                            continue;
                        }
                    } else if (400..500).contains(&status) {
                        // Client errors are not recoverable by retrying
                        warn!(status, "slack rejected message");
                        return ChannelResponse::failed(last_error, attempt + 1);
                    } else {
                        warn!(status, attempt = attempt + 1, "slack server error");
                    }
                }
                Err(err) => {
                    last_error = err.to_string();
                    warn!(error = %last_error, attempt = attempt + 1, "slack request errored");
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
