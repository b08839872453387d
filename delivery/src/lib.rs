//! Alert delivery agent
//!
//! Consumes `matches:computed` and fans alerts out over email, SMS, and
//! Slack according to priority and user preferences, with idempotent
//! per-channel delivery tracking and daily digest batching for
//! lower-priority matches.

pub mod alerter;
pub mod content;
pub mod digest;
pub mod models;
pub mod tracking;

pub use alerter::Alerter;
pub use digest::{DigestProcessor, DIGEST_ITEM_LIMIT};
pub use tracking::{DeliveryTracker, EmailEvent, SmsStatusCallback};
pub use models::{
    default_channels, determine_priority, enabled_channels, AlertPayload, AlertPriority,
    DeliveryChannel, MatchInfo,
};
