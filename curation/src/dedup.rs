//! Cross-source duplicate detection and merge
//!
//! Cheap screening runs against the bounded recent-validated list: a
//! candidate is anything with a title within Levenshtein distance 2 (on
//! the lowercased first 100 characters) or the same external id from a
//! different source. Candidates are confirmed by an LLM yes/no before the
//! merge.

use chrono::{DateTime, Utc};
use grantradar_events::DiscoveredGrant;
use grantradar_storage::GrantRecord;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum title edit distance that still counts as a candidate
pub const MAX_TITLE_DISTANCE: usize = 2;
/// Confidence assigned to grants that went through a merge
pub const MERGED_CONFIDENCE: f64 = 0.8;

/// Slim record pushed to `grants:validated:recent` to feed screening
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentValidatedGrant {
    pub grant_id: Uuid,
    pub source: String,
    #[serde(default)]
    pub sources: Vec<String>,
    pub external_id: String,
    pub title: String,
    pub validated_at: DateTime<Utc>,
}

impl RecentValidatedGrant {
    pub fn from_record(record: &GrantRecord) -> Self {
        Self {
            grant_id: record.grant_id,
            source: record.source.clone(),
            sources: record.sources.clone(),
            external_id: record.external_id.clone(),
            title: record.title.clone(),
            validated_at: record.validated_at,
        }
    }
}

/// Lowercased first 100 characters of a title, the comparison key
fn title_key(title: &str) -> String {
    title.to_lowercase().chars().take(100).collect()
}

/// Whether `incoming` might be the same grant as `recent`
pub fn is_duplicate_candidate(incoming: &DiscoveredGrant, recent: &RecentValidatedGrant) -> bool {
    if incoming.external_id == recent.external_id && incoming.source != recent.source {
        return true;
    }

    strsim::levenshtein(&title_key(&incoming.title), &title_key(&recent.title))
        <= MAX_TITLE_DISTANCE
}

/// Merge a confirmed duplicate into the existing record: keep the longer
/// description, union the sources, keep the earliest discovery time, and
/// cap confidence at the merged level.
pub fn merge_duplicate(mut existing: GrantRecord, incoming: &DiscoveredGrant) -> GrantRecord {
    let incoming_desc_len = incoming.description.as_deref().map(str::len).unwrap_or(0);
    let existing_desc_len = existing.description.as_deref().map(str::len).unwrap_or(0);
    if incoming_desc_len > existing_desc_len {
        existing.description = incoming.description.clone();
    }

    if !existing.sources.contains(&incoming.source) {
        existing.sources.push(incoming.source.clone());
    }

    if incoming.discovered_at < existing.discovered_at {
        existing.discovered_at = incoming.discovered_at;
    }

    existing.confidence_score = existing.confidence_score.min(MERGED_CONFIDENCE);
    existing.validated_at = Utc::now();
    existing
}

/// Prompt for the LLM duplicate confirmation
pub fn duplicate_prompt(incoming: &DiscoveredGrant, recent: &RecentValidatedGrant) -> String {
    format!(
        "Are these two grant records the same funding opportunity?\n\n\
         RECORD A:\nSource: {}\nExternal ID: {}\nTitle: {}\n\n\
         RECORD B:\nSource: {}\nExternal ID: {}\nTitle: {}\n\n\
         Return ONLY a JSON object: {{\"same\": true/false}}",
        incoming.source,
        incoming.external_id,
        incoming.title,
        recent.source,
        recent.external_id,
        recent.title,
    )
}

/// LLM duplicate verdict shape
#[derive(Debug, Deserialize)]
pub struct DuplicateVerdict {
    pub same: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(source: &str, external_id: &str, title: &str) -> DiscoveredGrant {
        DiscoveredGrant {
            source: source.to_string(),
            external_id: external_id.to_string(),
            title: title.to_string(),
            description: Some("short".to_string()),
            url: "https://example.org".to_string(),
            funding_agency: None,
            estimated_amount: None,
            amount_min: None,
            amount_max: None,
            deadline: None,
            eligibility: None,
            discovered_at: Utc::now(),
            raw_data: None,
        }
    }

    fn recent(source: &str, external_id: &str, title: &str) -> RecentValidatedGrant {
        RecentValidatedGrant {
            grant_id: Uuid::new_v4(),
            source: source.to_string(),
            sources: vec![source.to_string()],
            external_id: external_id.to_string(),
            title: title.to_string(),
            validated_at: Utc::now(),
        }
    }

    fn record(source: &str, description: Option<&str>) -> GrantRecord {
        GrantRecord {
            grant_id: Uuid::new_v4(),
            source: source.to_string(),
            sources: vec![source.to_string()],
            external_id: "OPP-1".to_string(),
            title: "Community Econ Dev".to_string(),
            description: description.map(|s| s.to_string()),
            url: "https://example.org".to_string(),
            funding_agency: None,
            amount_min: None,
            amount_max: None,
            deadline: None,
            eligibility: None,
            categories: vec![],
            keywords: vec![],
            quality_score: 85.0,
            confidence_score: 1.0,
            embedding: None,
            posted_at: None,
            discovered_at: Utc::now(),
            validated_at: Utc::now(),
        }
    }

    #[test]
    fn near_identical_titles_are_candidates() {
        let a = incoming("nsf", "A-1", "Community Econ Dev");
        let b = recent("grants_gov", "B-2", "Community Econ Dev.");
        assert!(is_duplicate_candidate(&a, &b));
    }

    #[test]
    fn distant_titles_are_not_candidates() {
        let a = incoming("nsf", "A-1", "Quantum Computing Research");
        let b = recent("grants_gov", "B-2", "Community Econ Dev");
        assert!(!is_duplicate_candidate(&a, &b));
    }

    #[test]
    fn same_external_id_different_source_is_a_candidate() {
        let a = incoming("nsf", "OPP-1", "Totally Different Name Here");
        let b = recent("grants_gov", "OPP-1", "Community Econ Dev");
        assert!(is_duplicate_candidate(&a, &b));
    }

    #[test]
    fn same_external_id_same_source_uses_title_rule_only() {
        let a = incoming("nsf", "OPP-1", "Totally Different Name Here");
        let b = recent("nsf", "OPP-1", "Community Econ Dev");
        assert!(!is_duplicate_candidate(&a, &b));
    }

    #[test]
    fn comparison_uses_first_hundred_chars_case_insensitive() {
        let long_a = format!("{} tail A", "x".repeat(100));
        let long_b = format!("{} tail B completely different", "X".repeat(100));
        let a = incoming("nsf", "A-1", &long_a);
        let b = recent("grants_gov", "B-2", &long_b);
        assert!(is_duplicate_candidate(&a, &b));
    }

    #[test]
    fn merge_prefers_longer_description_and_unions_sources() {
        let existing = record("grants_gov", Some("short"));
        let mut new = incoming("nsf", "OPP-1", "Community Econ Dev");
        new.description = Some("a much longer and more complete description".to_string());

        let merged = merge_duplicate(existing, &new);
        assert_eq!(
            merged.description.as_deref(),
            Some("a much longer and more complete description")
        );
        assert_eq!(merged.sources, vec!["grants_gov", "nsf"]);
        assert_eq!(merged.confidence_score, MERGED_CONFIDENCE);
    }

    #[test]
    fn merge_keeps_earliest_discovery_time() {
        let mut existing = record("grants_gov", Some("description"));
        existing.discovered_at = Utc::now();
        let mut new = incoming("nsf", "OPP-1", "Community Econ Dev");
        new.discovered_at = existing.discovered_at - chrono::Duration::hours(6);

        let merged = merge_duplicate(existing, &new);
        assert_eq!(merged.discovered_at, new.discovered_at);
    }

    #[test]
    fn merge_never_raises_confidence() {
        let mut existing = record("grants_gov", Some("description"));
        existing.confidence_score = 0.5;
        let new = incoming("nsf", "OPP-1", "Community Econ Dev");

        let merged = merge_duplicate(existing, &new);
        assert_eq!(merged.confidence_score, 0.5);
    }
}
