//! Stream envelope types
//!
//! Every stream message wraps a single `data` field whose value is one of
//! these JSON shapes. Unknown keys are ignored on deserialization; the
//! shapes themselves are closed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stream carrying normalized grants from discovery agents
pub const DISCOVERED_STREAM: &str = "grants:discovered";
/// Stream carrying validated, enriched grants from curation
pub const VALIDATED_STREAM: &str = "grants:validated";
/// Stream carrying high-scoring matches from the matcher
pub const MATCHES_STREAM: &str = "matches:computed";
/// Informational stream of sent alerts
pub const ALERTS_SENT_STREAM: &str = "alerts:sent";

/// Consumer group for the curation validators
pub const CURATION_GROUP: &str = "curation_validators";
/// Consumer group for the matching engine
pub const MATCHING_GROUP: &str = "matching_engine";
/// Consumer group for the alerter
pub const ALERTER_GROUP: &str = "alerter";

/// Dead-letter stream name for a source stream
pub fn dlq_stream(stream: &str) -> String {
    format!("dlq:{stream}")
}

/// Priority levels for grant matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    /// Urgent deadline and high match score
    Critical,
    /// Strong match or approaching deadline
    High,
    /// Good match, flexible deadline
    Medium,
    /// Marginal match or distant deadline
    Low,
}

impl PriorityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityLevel::Critical => "critical",
            PriorityLevel::High => "high",
            PriorityLevel::Medium => "medium",
            PriorityLevel::Low => "low",
        }
    }
}

/// Normalized grant record emitted by a discovery agent.
///
/// Identity is `(source, external_id)`; the record is immutable once
/// published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredGrant {
    pub source: String,
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub funding_agency: Option<String>,
    #[serde(default)]
    pub estimated_amount: Option<f64>,
    #[serde(default)]
    pub amount_min: Option<f64>,
    #[serde(default)]
    pub amount_max: Option<f64>,
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub eligibility: Option<serde_json::Value>,
    pub discovered_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_data: Option<serde_json::Value>,
}

/// Validation detail block carried on the validated event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationDetails {
    pub confidence_score: f64,
    pub validated_at: DateTime<Utc>,
}

/// Event emitted when a grant passes quality validation.
///
/// Published to `grants:validated`. `quality_score` is normalized to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantValidatedEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub grant_id: Uuid,
    pub quality_score: f64,
    pub categories: Vec<String>,
    pub embedding_generated: bool,
    pub validation_details: ValidationDetails,
    #[serde(default)]
    pub eligibility_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
}

/// Event emitted when a grant-user match clears the publish threshold.
///
/// Published to `matches:computed`. `match_score` is normalized to [0, 1].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchComputedEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub match_id: Uuid,
    pub grant_id: Uuid,
    pub user_id: Uuid,
    pub match_score: f64,
    pub priority_level: PriorityLevel,
    #[serde(default)]
    pub matching_criteria: Option<Vec<String>>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub grant_deadline: Option<DateTime<Utc>>,
}

/// Envelope moved to `dlq:<stream>` after unrecoverable processing failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub original_stream: String,
    pub original_message_id: String,
    pub original_payload: serde_json::Value,
    pub error_message: String,
    pub error_type: String,
    pub failure_count: u32,
    pub first_failure_at: DateTime<Utc>,
    pub last_failure_at: DateTime<Utc>,
}

/// Current envelope schema version
pub const EVENT_VERSION: &str = "1.0";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovered_grant_round_trips() {
        let grant = DiscoveredGrant {
            source: "nsf".to_string(),
            external_id: "2300001".to_string(),
            title: "Quantum sensing for climate models".to_string(),
            description: Some("Development of quantum sensors".to_string()),
            url: "https://nsf.gov/awards/2300001".to_string(),
            funding_agency: Some("NSF".to_string()),
            estimated_amount: Some(500_000.0),
            amount_min: None,
            amount_max: Some(500_000.0),
            deadline: None,
            eligibility: None,
            discovered_at: Utc::now(),
            raw_data: None,
        };

        let json = serde_json::to_string(&grant).unwrap();
        let parsed: DiscoveredGrant = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.source, "nsf");
        assert_eq!(parsed.external_id, "2300001");
        assert_eq!(parsed.estimated_amount, Some(500_000.0));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let json = serde_json::json!({
            "source": "nih",
            "external_id": "R01-1",
            "title": "Title",
            "url": "https://example.org",
            "discovered_at": Utc::now(),
            "surprise_field": {"nested": true},
        });

        let parsed: DiscoveredGrant = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.source, "nih");
        assert!(parsed.description.is_none());
    }

    #[test]
    fn priority_level_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&PriorityLevel::Critical).unwrap(),
            "\"critical\""
        );
        let parsed: PriorityLevel = serde_json::from_str("\"high\"").unwrap();
        assert_eq!(parsed, PriorityLevel::High);
    }

    #[test]
    fn validated_event_scores_are_normalized() {
        let event = GrantValidatedEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: EVENT_VERSION.to_string(),
            grant_id: Uuid::new_v4(),
            quality_score: 0.92,
            categories: vec!["Biomedical".to_string()],
            embedding_generated: true,
            validation_details: ValidationDetails {
                confidence_score: 1.0,
                validated_at: Utc::now(),
            },
            eligibility_criteria: None,
            keywords: Some(vec!["oncology".to_string()]),
        };

        let value = serde_json::to_value(&event).unwrap();
        let score = value["quality_score"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn dlq_stream_name() {
        assert_eq!(dlq_stream(DISCOVERED_STREAM), "dlq:grants:discovered");
    }
}
