//! Matching data model and score laws
//!
//! Final score: 40% of the vector similarity (scaled to 0-100) plus 60%
//! of the LLM match score, rounded half away from zero. Only rounded
//! scores strictly above 70 are published.

use chrono::{DateTime, Utc};
use grantradar_events::PriorityLevel;
use grantradar_storage::{GrantRecord, ProfileCandidate};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Phase-1 similarity floor
pub const VECTOR_THRESHOLD: f64 = 0.6;
/// Phase-1 candidate cap
pub const TOP_CANDIDATES: i64 = 50;
/// Phase-2 re-rank cap
pub const LLM_RERANK_LIMIT: usize = 20;
/// Profiles evaluated per LLM call
pub const LLM_BATCH_SIZE: usize = 5;
/// Rounded final scores must exceed this to publish
pub const FINAL_MATCH_THRESHOLD: f64 = 70.0;

/// One profile's evaluation from the LLM re-rank
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMatchResult {
    pub user_id: Uuid,
    pub match_score: f64,
    pub reasoning: String,
    #[serde(default)]
    pub key_strengths: Vec<String>,
    #[serde(default)]
    pub concerns: Vec<String>,
    pub predicted_success: f64,
}

/// Weighted final score, rounded half away from zero.
pub fn compute_final_score(vector_similarity: f64, llm_match_score: f64) -> f64 {
    let raw = 0.4 * (vector_similarity * 100.0) + 0.6 * llm_match_score;
    raw.round()
}

/// Whether a rounded final score clears the publish threshold
pub fn should_publish(final_score: f64) -> bool {
    final_score > FINAL_MATCH_THRESHOLD
}

/// Priority level for downstream consumers.
///
/// Critical requires both a very high score and an imminent deadline;
/// high needs either a strong score or an approaching deadline.
pub fn priority_level(
    final_score: f64,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> PriorityLevel {
    let days_to_deadline = deadline.map(|d| (d - now).num_days());

    if final_score >= 90.0 {
        if let Some(days) = days_to_deadline {
            if days <= 7 {
                return PriorityLevel::Critical;
            }
        }
    }

    if final_score >= 80.0 {
        return PriorityLevel::High;
    }
    if let Some(days) = days_to_deadline {
        if days <= 30 {
            return PriorityLevel::High;
        }
    }

    if final_score >= 70.0 {
        return PriorityLevel::Medium;
    }

    PriorityLevel::Low
}

/// Prompt for one batch of profile evaluations. The response must be a
/// JSON array in request order.
pub fn rerank_prompt(grant: &GrantRecord, batch: &[ProfileCandidate]) -> String {
    let mut grant_text = format!("Title: {}\n", grant.title);
    if let Some(description) = &grant.description {
        grant_text.push_str(&format!("Description: {description}\n"));
    }
    if let Some(agency) = &grant.funding_agency {
        grant_text.push_str(&format!("Funding Agency: {agency}\n"));
    }
    if let Some(amount) = grant.amount_max.or(grant.amount_min) {
        grant_text.push_str(&format!("Funding Amount: ${amount:.0}\n"));
    }
    if let Some(deadline) = grant.deadline {
        grant_text.push_str(&format!("Deadline: {}\n", deadline.format("%Y-%m-%d")));
    }
    if !grant.categories.is_empty() {
        grant_text.push_str(&format!("Categories: {}\n", grant.categories.join(", ")));
    }

    let mut profiles_text = String::new();
    for (i, candidate) in batch.iter().enumerate() {
        profiles_text.push_str(&format!(
            "\n--- Profile {} (User ID: {}) ---\n{}\nVector Similarity: {:.3}\n",
            i + 1,
            candidate.profile.user_id,
            candidate.profile.to_embedding_text(),
            candidate.vector_similarity,
        ));
    }

    format!(
        "You are evaluating grant-researcher matches for a grant intelligence platform.\n\n\
         GRANT INFORMATION:\n{grant_text}\n\
         RESEARCHER PROFILES TO EVALUATE:\n{profiles_text}\n\
         For each profile, evaluate the fit between the researcher and this grant.\n\n\
         Return a JSON array with one object per profile, in the same order as provided:\n\
         [{{\"user_id\": \"<user_id>\", \"match_score\": <0-100>, \
         \"reasoning\": \"<explanation>\", \"key_strengths\": [\"...\"], \
         \"concerns\": [\"...\"], \"predicted_success\": <0-100>}}, ...]\n\n\
         Scoring guidelines: 90-100 exceptional fit, 70-89 strong fit, 50-69 moderate, \
         30-49 weak, 0-29 poor. Consider research area alignment, methods, prior grant \
         experience, institutional fit, and eligibility.\n\n\
         Return ONLY the JSON array, no additional text."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn score_law_matches_weighting() {
        // 0.4 * (0.9 * 100) + 0.6 * 90 = 90
        assert_eq!(compute_final_score(0.9, 90.0), 90.0);
        // 0.4 * 100 + 0.6 * 100 = 100
        assert_eq!(compute_final_score(1.0, 100.0), 100.0);
        // 0.4 * 60 + 0.6 * 70 = 66
        assert_eq!(compute_final_score(0.6, 70.0), 66.0);
    }

    #[test]
    fn rounding_is_half_away_from_zero() {
        // raw = 0.4*62.5 + 0.6*75.5 = 25 + 45.3 = 70.3 -> 70, not published
        assert_eq!(compute_final_score(0.625, 75.5), 70.0);
        assert!(!should_publish(70.0));

        // raw = 0.4*63.75 + 0.6*75.0 = 25.5 + 45 = 70.5 -> 71, published
        assert_eq!(compute_final_score(0.6375, 75.0), 71.0);
        assert!(should_publish(71.0));
    }

    #[test]
    fn exactly_seventy_does_not_publish() {
        assert!(!should_publish(70.0));
        assert!(should_publish(70.5_f64.round()));
    }

    #[test]
    fn critical_needs_both_score_and_deadline() {
        let now = Utc::now();
        let soon = Some(now + Duration::days(5));
        let later = Some(now + Duration::days(60));

        assert_eq!(priority_level(92.0, soon, now), PriorityLevel::Critical);
        assert_eq!(priority_level(92.0, later, now), PriorityLevel::High);
        assert_eq!(priority_level(92.0, None, now), PriorityLevel::High);
        assert_eq!(priority_level(85.0, soon, now), PriorityLevel::High);
    }

    #[test]
    fn deadline_alone_can_raise_to_high() {
        let now = Utc::now();
        let close = Some(now + Duration::days(20));
        assert_eq!(priority_level(72.0, close, now), PriorityLevel::High);
        assert_eq!(priority_level(72.0, None, now), PriorityLevel::Medium);
    }

    #[test]
    fn low_scores_yield_low_priority() {
        let now = Utc::now();
        assert_eq!(priority_level(65.0, None, now), PriorityLevel::Low);
    }

    #[test]
    fn priority_is_monotonic_in_score() {
        let now = Utc::now();
        let deadline = Some(now + Duration::days(5));
        let rank = |p: PriorityLevel| match p {
            PriorityLevel::Low => 0,
            PriorityLevel::Medium => 1,
            PriorityLevel::High => 2,
            PriorityLevel::Critical => 3,
        };

        let mut previous = 0;
        for score in [60.0, 70.0, 75.0, 80.0, 85.0, 90.0, 95.0, 100.0] {
            let current = rank(priority_level(score, deadline, now));
            assert!(
                current >= previous,
                "priority dropped at score {score}"
            );
            previous = current;
        }
    }

    #[test]
    fn priority_is_monotonic_in_deadline_proximity() {
        let now = Utc::now();
        let rank = |p: PriorityLevel| match p {
            PriorityLevel::Low => 0,
            PriorityLevel::Medium => 1,
            PriorityLevel::High => 2,
            PriorityLevel::Critical => 3,
        };

        let mut previous = 0;
        for days in [90, 45, 30, 14, 7, 3, 1] {
            let current = rank(priority_level(
                91.0,
                Some(now + Duration::days(days)),
                now,
            ));
            assert!(
                current >= previous,
                "priority dropped at {days} days to deadline"
            );
            previous = current;
        }
    }

    #[test]
    fn llm_result_parses_with_optional_lists() {
        let parsed: LlmMatchResult = serde_json::from_str(
            r#"{"user_id": "8f14e45f-ceea-4e47-a9ad-39e46aef7c41",
                "match_score": 90, "reasoning": "strong oncology fit",
                "predicted_success": 80}"#,
        )
        .unwrap();
        assert_eq!(parsed.match_score, 90.0);
        assert!(parsed.key_strengths.is_empty());
    }
}
