//! Quality scoring
//!
//! Primary path asks the LLM for a structured verdict; when the LLM is
//! unavailable the rubric applies fixed penalties instead. A score of
//! exactly the threshold passes.

use chrono::{DateTime, Utc};
use grantradar_events::DiscoveredGrant;
use serde::{Deserialize, Serialize};

/// Grants scoring below this go to manual review
pub const QUALITY_THRESHOLD: f64 = 70.0;

/// Structured validation verdict, from the LLM or the rubric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub quality_score: f64,
    #[serde(default)]
    pub issues: Vec<String>,
}

impl ValidationResult {
    pub fn passes_threshold(&self) -> bool {
        self.quality_score >= QUALITY_THRESHOLD
    }
}

/// Deterministic fallback rubric: start at 100 and subtract fixed
/// penalties for missing title (30), missing description (20), missing
/// deadline (20), and an already-expired deadline (50).
pub fn rubric_score(grant: &DiscoveredGrant, now: DateTime<Utc>) -> ValidationResult {
    let mut score: f64 = 100.0;
    let mut issues = Vec::new();

    if grant.title.trim().is_empty() {
        score -= 30.0;
        issues.push("Missing title".to_string());
    }

    if grant
        .description
        .as_deref()
        .map(|d| d.trim().is_empty())
        .unwrap_or(true)
    {
        score -= 20.0;
        issues.push("Missing description".to_string());
    }

    match grant.deadline {
        None => {
            score -= 20.0;
            issues.push("Missing deadline".to_string());
        }
        Some(deadline) if deadline < now => {
            score -= 50.0;
            issues.push("Expired deadline".to_string());
        }
        Some(_) => {}
    }

    let score = score.max(0.0);

    ValidationResult {
        is_valid: score >= QUALITY_THRESHOLD,
        quality_score: score,
        issues,
    }
}

/// Prompt for the LLM validation call
pub fn validation_prompt(grant: &DiscoveredGrant) -> String {
    format!(
        "You are validating grant opportunity data quality for a research \
         intelligence platform.\n\n\
         GRANT:\n\
         Title: {}\n\
         Description: {}\n\
         Funding Agency: {}\n\
         URL: {}\n\
         Deadline: {}\n\n\
         Evaluate completeness, coherence, and whether this looks like a \
         real funding opportunity. Return ONLY a JSON object:\n\
         {{\"is_valid\": true/false, \"quality_score\": <0-100>, \
         \"issues\": [\"...\"]}}",
        grant.title,
        grant.description.as_deref().unwrap_or("(none)"),
        grant.funding_agency.as_deref().unwrap_or("(unknown)"),
        grant.url,
        grant
            .deadline
            .map(|d| d.to_rfc3339())
            .unwrap_or_else(|| "(none)".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant(description: Option<&str>, deadline: Option<DateTime<Utc>>) -> DiscoveredGrant {
        DiscoveredGrant {
            source: "nih".to_string(),
            external_id: "R01-CA-1".to_string(),
            title: "Novel targeted therapy in cancer".to_string(),
            description: description.map(|s| s.to_string()),
            url: "https://example.org".to_string(),
            funding_agency: None,
            estimated_amount: None,
            amount_min: None,
            amount_max: None,
            deadline,
            eligibility: None,
            discovered_at: Utc::now(),
            raw_data: None,
        }
    }

    #[test]
    fn complete_grant_scores_full_marks() {
        let now = Utc::now();
        let result = rubric_score(&grant(Some("details"), Some(now + Duration::days(30))), now);
        assert_eq!(result.quality_score, 100.0);
        assert!(result.issues.is_empty());
        assert!(result.is_valid);
    }

    #[test]
    fn missing_description_and_deadline_scores_sixty() {
        let now = Utc::now();
        let result = rubric_score(&grant(None, None), now);
        assert_eq!(result.quality_score, 60.0);
        assert_eq!(
            result.issues,
            vec!["Missing description".to_string(), "Missing deadline".to_string()]
        );
        assert!(!result.is_valid);
        assert!(!result.passes_threshold());
    }

    #[test]
    fn expired_deadline_takes_the_heavy_penalty() {
        let now = Utc::now();
        let result = rubric_score(&grant(Some("details"), Some(now - Duration::days(1))), now);
        assert_eq!(result.quality_score, 50.0);
        assert_eq!(result.issues, vec!["Expired deadline".to_string()]);
    }

    #[test]
    fn score_never_goes_negative() {
        let now = Utc::now();
        let mut g = grant(None, Some(now - Duration::days(1)));
        g.title = String::new();
        let result = rubric_score(&g, now);
        assert_eq!(result.quality_score, 0.0);
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let at_threshold = ValidationResult {
            is_valid: true,
            quality_score: 70.0,
            issues: vec![],
        };
        let below = ValidationResult {
            is_valid: false,
            quality_score: 69.0,
            issues: vec![],
        };
        assert!(at_threshold.passes_threshold());
        assert!(!below.passes_threshold());
    }

    #[test]
    fn llm_verdict_parses_from_json() {
        let result: ValidationResult =
            serde_json::from_str(r#"{"is_valid": true, "quality_score": 92}"#).unwrap();
        assert!(result.is_valid);
        assert_eq!(result.quality_score, 92.0);
        assert!(result.issues.is_empty());
    }
}
