//! External service gateways
//!
//! Typed client wrappers around the LLM provider, embedding provider, and
//! the three alert channels, each guarded by retry policy and circuit
//! breaker state. No gateway holds global state; construct them once per
//! process and pass them through constructors.

pub mod cache;
pub mod email;
pub mod embeddings;
pub mod llm;
pub mod slack;
pub mod sms;
pub mod sources;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use cache::ResponseCache;
pub use email::{EmailGateway, EmailMessage};
pub use embeddings::EmbeddingClient;
pub use llm::{parse_json_response, LlmClient, LlmError, LlmFailover, LlmProvider};
pub use slack::{SlackGateway, SlackMessage};
pub use sms::{SmsGateway, SmsMessage};
pub use sources::SourceGate;

/// Outcome of one channel send, independent of provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelResponse {
    /// sent, delivered, or failed
    pub status: String,
    pub provider_message_id: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Attempts beyond the first
    pub retry_count: u32,
}

impl ChannelResponse {
    pub fn sent(provider_message_id: String, retry_count: u32) -> Self {
        Self {
            status: "sent".to_string(),
            provider_message_id: Some(provider_message_id),
            sent_at: Some(Utc::now()),
            delivered_at: None,
            error_message: None,
            retry_count,
        }
    }

    pub fn delivered(retry_count: u32) -> Self {
        let now = Utc::now();
        Self {
            status: "delivered".to_string(),
            provider_message_id: None,
            sent_at: Some(now),
            delivered_at: Some(now),
            error_message: None,
            retry_count,
        }
    }

    pub fn failed(error: impl Into<String>, retry_count: u32) -> Self {
        Self {
            status: "failed".to_string(),
            provider_message_id: None,
            sent_at: None,
            delivered_at: None,
            error_message: Some(error.into()),
            retry_count,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.status == "sent" || self.status == "delivered"
    }
}

/// Fixed retry delays for channel sends, in seconds
pub(crate) const CHANNEL_RETRY_DELAYS: [u64; 3] = [1, 2, 4];
