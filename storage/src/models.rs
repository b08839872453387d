//! Entity store record types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A grant as persisted after curation.
///
/// Created by the curation validator and read by every later stage; never
/// mutated by the matcher or alerter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRecord {
    pub grant_id: Uuid,
    pub source: String,
    /// All sources this grant was observed from; grows on dedup merge
    pub sources: Vec<String>,
    pub external_id: String,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub funding_agency: Option<String>,
    pub amount_min: Option<f64>,
    pub amount_max: Option<f64>,
    pub deadline: Option<DateTime<Utc>>,
    pub eligibility: Option<serde_json::Value>,
    pub categories: Vec<String>,
    pub keywords: Vec<String>,
    pub quality_score: f64,
    pub confidence_score: f64,
    pub embedding: Option<Vec<f32>>,
    pub posted_at: Option<DateTime<Utc>>,
    pub discovered_at: DateTime<Utc>,
    pub validated_at: DateTime<Utc>,
}

/// A user with notification preferences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub name: Option<String>,
    pub email: String,
    pub phone: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub preferences: NotificationPreferences,
}

impl UserRecord {
    /// Display name, falling back to the mailbox part of the address
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| {
            self.email
                .split('@')
                .next()
                .unwrap_or("there")
                .to_string()
        })
    }
}

/// User notification preferences for alert delivery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPreferences {
    pub email_notifications: bool,
    pub sms_notifications: bool,
    pub slack_notifications: bool,
    /// One of immediate, daily, weekly
    pub digest_frequency: String,
    /// Normalized minimum match score, [0, 1]
    pub minimum_match_score: f64,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email_notifications: true,
            sms_notifications: false,
            slack_notifications: false,
            digest_frequency: "immediate".to_string(),
            minimum_match_score: 0.7,
        }
    }
}

/// A research profile used for matching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub user_id: Uuid,
    pub research_areas: Vec<String>,
    pub methods: Vec<String>,
    pub past_grants: Vec<String>,
    pub institution: Option<String>,
    pub department: Option<String>,
    pub keywords: Vec<String>,
    pub source_text_hash: Option<String>,
    pub embedding_updated_at: Option<DateTime<Utc>>,
}

impl ProfileRecord {
    /// Canonical text representation used for embedding generation.
    ///
    /// The sha256 of this text is stored as `source_text_hash`; the
    /// embedding is regenerated only when the hash changes.
    pub fn to_embedding_text(&self) -> String {
        let mut parts = Vec::new();

        if !self.research_areas.is_empty() {
            parts.push(format!("Research areas: {}", self.research_areas.join(", ")));
        }
        if !self.methods.is_empty() {
            parts.push(format!("Methods: {}", self.methods.join(", ")));
        }
        if !self.past_grants.is_empty() {
            parts.push(format!("Past grants: {}", self.past_grants.join("; ")));
        }
        if let Some(institution) = &self.institution {
            parts.push(format!("Institution: {institution}"));
        }
        if let Some(department) = &self.department {
            parts.push(format!("Department: {department}"));
        }
        if !self.keywords.is_empty() {
            parts.push(format!("Keywords: {}", self.keywords.join(", ")));
        }

        parts.join("\n")
    }
}

/// Phase-1 result: a profile with its cosine similarity to a grant
#[derive(Debug, Clone)]
pub struct ProfileCandidate {
    pub profile: ProfileRecord,
    pub vector_similarity: f64,
}

/// A computed grant-user match, unique per (grant_id, user_id)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: Uuid,
    pub grant_id: Uuid,
    pub user_id: Uuid,
    pub vector_similarity: f64,
    pub llm_match_score: f64,
    pub final_score: f64,
    pub reasoning: String,
    pub key_strengths: Vec<String>,
    pub concerns: Vec<String>,
    pub predicted_success: f64,
    pub created_at: DateTime<Utc>,
}

/// One delivery attempt on one channel for one match
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDeliveryRecord {
    pub alert_id: Uuid,
    pub match_id: Uuid,
    pub channel: String,
    /// pending, sent, delivered, failed
    pub status: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub provider_message_id: Option<String>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub latency_seconds: Option<f64>,
}

/// A grant sidelined for human review
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualReviewItem {
    pub grant_id: Uuid,
    pub reason: String,
    pub quality_score: f64,
    pub issues: Vec<String>,
    pub grant_snapshot: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Render an embedding as a pgvector literal: `[0.1,0.2,...]`
pub fn embedding_literal(embedding: &[f32]) -> String {
    let mut out = String::with_capacity(embedding.len() * 10 + 2);
    out.push('[');
    for (i, value) in embedding.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&value.to_string());
    }
    out.push(']');
    out
}

/// Parse a pgvector literal back into a vector. Malformed components are
/// dropped rather than failing the whole row.
pub fn parse_embedding_literal(literal: &str) -> Vec<f32> {
    literal
        .trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .filter_map(|part| part.trim().parse::<f32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedding_literal_round_trips() {
        let embedding = vec![0.25_f32, -1.5, 3.0];
        let literal = embedding_literal(&embedding);
        assert_eq!(literal, "[0.25,-1.5,3]");
        assert_eq!(parse_embedding_literal(&literal), embedding);
    }

    #[test]
    fn parse_tolerates_whitespace_and_junk() {
        assert_eq!(parse_embedding_literal("[ 1.0, x, 2.0 ]"), vec![1.0, 2.0]);
        assert!(parse_embedding_literal("").is_empty());
    }

    #[test]
    fn profile_embedding_text_is_stable() {
        let profile = ProfileRecord {
            user_id: Uuid::new_v4(),
            research_areas: vec!["oncology".to_string(), "genomics".to_string()],
            methods: vec!["CRISPR".to_string()],
            past_grants: vec![],
            institution: Some("State University".to_string()),
            department: None,
            keywords: vec!["cancer".to_string()],
            source_text_hash: None,
            embedding_updated_at: None,
        };

        let text = profile.to_embedding_text();
        assert!(text.starts_with("Research areas: oncology, genomics"));
        assert!(text.contains("Methods: CRISPR"));
        assert!(text.contains("Institution: State University"));
        assert!(!text.contains("Department"));
    }

    #[test]
    fn display_name_falls_back_to_mailbox() {
        let user = UserRecord {
            user_id: Uuid::new_v4(),
            name: None,
            email: "jsmith@lab.edu".to_string(),
            phone: None,
            slack_webhook_url: None,
            preferences: NotificationPreferences::default(),
        };
        assert_eq!(user.display_name(), "jsmith");
    }

    #[test]
    fn default_preferences_match_product_defaults() {
        let prefs = NotificationPreferences::default();
        assert!(prefs.email_notifications);
        assert!(!prefs.sms_notifications);
        assert_eq!(prefs.digest_frequency, "immediate");
        assert_eq!(prefs.minimum_match_score, 0.7);
    }
}
