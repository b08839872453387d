//! SMS delivery channel (Twilio-style)
//!
//! Single attempt by design: a failed SMS for a critical alert is recorded
//! and surfaced rather than retried, since email and Slack carry the same
//! alert. The provider error code is preserved on failure.

use crate::ChannelResponse;
use grantradar_config::SmsSettings;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info};

/// One SMS to deliver
#[derive(Debug, Clone)]
pub struct SmsMessage {
    /// E.164 recipient number
    pub to: String,
    /// Message body, at most 160 characters
    pub body: String,
}

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    message: Option<String>,
}

/// SMS gateway client
pub struct SmsGateway {
    http: reqwest::Client,
    settings: SmsSettings,
}

impl SmsGateway {
    pub fn new(settings: &SmsSettings) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            settings: settings.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.settings.account_sid.is_empty()
            && !self.settings.auth_token.is_empty()
            && !self.settings.from_number.is_empty()
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/Accounts/{}/Messages.json",
            self.settings.base_url.trim_end_matches('/'),
            self.settings.account_sid
        )
    }

    /// Send a single SMS. The body is hard-truncated to 160 characters.
    pub async fn send(&self, message: &SmsMessage) -> ChannelResponse {
        let body: String = message.body.chars().take(160).collect();

        let mut form = vec![
            ("From", self.settings.from_number.clone()),
            ("To", message.to.clone()),
            ("Body", body),
        ];
        if !self.settings.status_callback_url.is_empty() {
            form.push(("StatusCallback", self.settings.status_callback_url.clone()));
        }

        let result = self
            .http
            .post(self.messages_url())
            .basic_auth(&self.settings.account_sid, Some(&self.settings.auth_token))
            .form(&form)
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                error!(error = %err, "sms send failed");
                return ChannelResponse::failed(err.to_string(), 0);
            }
        };

        let status = response.status();
        let parsed: ProviderResponse = match response.json().await {
            Ok(parsed) => parsed,
            Err(err) => {
                error!(error = %err, "sms response parse failed");
                return ChannelResponse::failed(err.to_string(), 0);
            }
        };

        match parsed.sid {
            Some(sid) if status.is_success() => {
                // Log only the tail of the number
                let suffix: String = message
                    .to
                    .chars()
                    .rev()
                    .take(4)
                    .collect::<String>()
                    .chars()
                    .rev()
                    .collect();
                info!(to_suffix = %suffix, sid = %sid, "sms sent");
                ChannelResponse::sent(sid, 0)
            }
            _ => {
                let error = format!(
                    "provider error {}: {}",
                    parsed.code.unwrap_or(status.as_u16() as i64),
                    parsed.message.unwrap_or_else(|| "unknown".to_string())
                );
                error!(error = %error, "sms rejected by provider");
                ChannelResponse::failed(error, 0)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_settings(url: String) -> SmsSettings {
        SmsSettings {
            base_url: url,
            account_sid: "AC123".to_string(),
            auth_token: "token".to_string(),
            from_number: "+15550001111".to_string(),
            status_callback_url: String::new(),
        }
    }

    #[tokio::test]
    async fn successful_send_returns_sid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/Accounts/AC123/Messages.json")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sid": "SM_abc", "status": "queued"}"#)
            .create_async()
            .await;

        let gateway = SmsGateway::new(&test_settings(server.url()));
        let response = gateway
            .send(&SmsMessage {
                to: "+15551234567".to_string(),
                body: "GrantRadar Alert".to_string(),
            })
            .await;

        assert_eq!(response.status, "sent");
        assert_eq!(response.provider_message_id.as_deref(), Some("SM_abc"));
    }

    #[tokio::test]
    async fn provider_error_code_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/Accounts/AC123/Messages.json")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code": 21211, "message": "Invalid 'To' phone number"}"#)
            .expect(1)
            .create_async()
            .await;

        let gateway = SmsGateway::new(&test_settings(server.url()));
        let response = gateway
            .send(&SmsMessage {
                to: "bad".to_string(),
                body: "x".to_string(),
            })
            .await;

        assert_eq!(response.status, "failed");
        assert!(response.error_message.unwrap().contains("21211"));
        // Single attempt only
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn body_is_truncated_to_sms_limit() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/Accounts/AC123/Messages.json")
            .with_status(201)
            .with_header("content-type", "application/json")
            .with_body(r#"{"sid": "SM_x"}"#)
            .match_body(mockito::Matcher::Regex("Body=x{160}$".to_string()))
            .create_async()
            .await;

        let gateway = SmsGateway::new(&test_settings(server.url()));
        let long_body = "x".repeat(200);
        let response = gateway
            .send(&SmsMessage {
                to: "+15551234567".to_string(),
                body: long_body,
            })
            .await;

        assert_eq!(response.status, "sent");
    }
}
