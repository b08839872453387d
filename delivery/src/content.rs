//! Alert content generation
//!
//! Email subjects and bodies are LLM-authored with deterministic template
//! fallbacks; SMS is a fixed 160-character template; Slack uses Block Kit
//! blocks. The SMS title is truncated to 50 characters with a trailing
//! ellipsis.

use crate::models::{AlertPayload, MatchInfo};
use chrono::{DateTime, Utc};
use grantradar_storage::{GrantRecord, UserRecord};
use serde_json::json;

/// SMS title budget before the ellipsis
const SMS_TITLE_LIMIT: usize = 50;
/// Hard SMS body limit
const SMS_BODY_LIMIT: usize = 160;

fn score_pct(match_info: &MatchInfo) -> i64 {
    (match_info.match_score * 100.0).round() as i64
}

fn deadline_short(deadline: Option<DateTime<Utc>>) -> String {
    deadline
        .map(|d| d.format("%m/%d").to_string())
        .unwrap_or_else(|| "Open".to_string())
}

fn deadline_long(deadline: Option<DateTime<Utc>>) -> String {
    deadline
        .map(|d| d.format("%B %d, %Y").to_string())
        .unwrap_or_else(|| "Open/Rolling".to_string())
}

/// SMS body: truncated title, score, deadline, short link. Always fits
/// the 160-character limit.
pub fn sms_text(grant: &GrantRecord, match_info: &MatchInfo, short_url: &str) -> String {
    let title = if grant.title.chars().count() > SMS_TITLE_LIMIT {
        let truncated: String = grant.title.chars().take(SMS_TITLE_LIMIT).collect();
        format!("{truncated}...")
    } else {
        grant.title.clone()
    };

    let message = format!(
        "GrantRadar Alert: {title} matches your research {}%. Deadline: {}. View: {short_url}",
        score_pct(match_info),
        deadline_short(grant.deadline),
    );

    message.chars().take(SMS_BODY_LIMIT).collect()
}

/// Slack Block Kit payload for one match
pub fn slack_blocks(grant: &GrantRecord, match_info: &MatchInfo) -> serde_json::Value {
    json!([
        {
            "type": "header",
            "text": {
                "type": "plain_text",
                "text": format!("New Grant Match: {}%", score_pct(match_info)),
                "emoji": true,
            },
        },
        {
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*{}*\n{}",
                    grant.title,
                    grant.funding_agency.as_deref().unwrap_or("Unknown Agency"),
                ),
            },
        },
        {
            "type": "section",
            "fields": [
                {
                    "type": "mrkdwn",
                    "text": format!("*Match Score:*\n{}%", score_pct(match_info)),
                },
                {
                    "type": "mrkdwn",
                    "text": format!("*Deadline:*\n{}", deadline_long(grant.deadline)),
                },
            ],
        },
        {
            "type": "section",
            "text": {
                "type": "mrkdwn",
                "text": format!(
                    "*Why it's a match:*\n{}",
                    match_info
                        .explanation
                        .as_deref()
                        .unwrap_or("Strong alignment with your research profile."),
                ),
            },
        },
        {
            "type": "actions",
            "elements": [
                {
                    "type": "button",
                    "text": {"type": "plain_text", "text": "View Grant Details"},
                    "url": grant.url,
                    "style": "primary",
                },
            ],
        },
    ])
}

/// Prompt asking the LLM for an email subject line
pub fn subject_prompt(grant: &GrantRecord, match_info: &MatchInfo) -> String {
    format!(
        "Write an engaging subject line (under 50 characters) for this grant alert:\n\
         Grant title: {}\nMatch score: {}%\nDeadline: {}\n\n\
         Return ONLY the subject line, no quotes or explanation.",
        grant.title,
        score_pct(match_info),
        deadline_long(grant.deadline),
    )
}

/// Prompt asking the LLM for a personalized email body
pub fn body_prompt(user: &UserRecord, grant: &GrantRecord, match_info: &MatchInfo) -> String {
    let amount = match (grant.amount_min, grant.amount_max) {
        (Some(min), Some(max)) => format!("${min:.0} - ${max:.0}"),
        (_, Some(max)) => format!("up to ${max:.0}"),
        (Some(min), _) => format!("from ${min:.0}"),
        _ => "Not specified".to_string(),
    };
    let description: String = grant
        .description
        .as_deref()
        .unwrap_or("")
        .chars()
        .take(500)
        .collect();

    format!(
        "Write a personalized alert email for {} about this grant:\n\n\
         Grant Title: {}\nFunding Agency: {}\nAmount: {amount}\nDeadline: {}\n\
         Description: {description}\n\n\
         Match Score: {}%\nMatching Criteria: {}\nReasoning: {}\n\n\
         Requirements: professional but friendly tone; cover why this fits, \
         the deadline, and a call to action to view details; under 200 words; \
         format as HTML paragraphs. Return the email body only.",
        user.display_name(),
        grant.title,
        grant.funding_agency.as_deref().unwrap_or("Unknown Agency"),
        deadline_long(grant.deadline),
        score_pct(match_info),
        if match_info.matching_criteria.is_empty() {
            "Strong overall fit".to_string()
        } else {
            match_info.matching_criteria.join(", ")
        },
        match_info
            .explanation
            .as_deref()
            .unwrap_or("This grant aligns well with your research profile."),
    )
}

/// Deterministic fallback subject when the LLM is unavailable
pub fn fallback_subject(grant: &GrantRecord, match_info: &MatchInfo) -> String {
    let title: String = grant.title.chars().take(40).collect();
    format!("{}% grant match: {title}", score_pct(match_info))
        .chars()
        .take(100)
        .collect()
}

/// Deterministic fallback body when the LLM is unavailable
pub fn fallback_body(user: &UserRecord, grant: &GrantRecord, match_info: &MatchInfo) -> String {
    format!(
        "<p>Hi {},</p>\
         <p>GrantRadar found a {}% match for your research profile: \
         <strong>{}</strong> from {}.</p>\
         <p>Deadline: {}. {}</p>",
        user.display_name(),
        score_pct(match_info),
        grant.title,
        grant.funding_agency.as_deref().unwrap_or("an unknown agency"),
        deadline_long(grant.deadline),
        match_info
            .explanation
            .as_deref()
            .unwrap_or("Review the full details to see if it fits your plans."),
    )
}

/// Wrap a generated body fragment into the full HTML email
pub fn email_html(grant: &GrantRecord, match_info: &MatchInfo, body_fragment: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; color: #333;">
  <div style="max-width: 600px; margin: 0 auto; padding: 20px;">
    <div style="background: #4f46e5; color: white; padding: 20px; border-radius: 8px 8px 0 0;">
      <h1 style="margin: 0;">New Grant Match</h1>
      <p style="margin: 8px 0 0;">GrantRadar found a {pct}% match for you</p>
    </div>
    <div style="background: #fff; padding: 24px; border: 1px solid #e5e7eb; border-top: none;">
      <h2 style="margin-top: 0;">{title}</h2>
      <p><strong>Agency:</strong> {agency}</p>
      {body_fragment}
      <a href="{url}" style="display: inline-block; background: #4f46e5; color: white; padding: 12px 24px; border-radius: 6px; text-decoration: none; margin-top: 16px;">View Full Grant Details</a>
    </div>
    <div style="text-align: center; padding: 16px; color: #6b7280; font-size: 12px;">
      <p>You're receiving this because you have grant alerts enabled.</p>
      <p>GrantRadar</p>
    </div>
  </div>
</body>
</html>"#,
        pct = score_pct(match_info),
        title = grant.title,
        agency = grant.funding_agency.as_deref().unwrap_or("Unknown Agency"),
        url = grant.url,
    )
}

/// Plain-text rendering of an HTML body fragment
pub fn email_text(user: &UserRecord, grant: &GrantRecord, body_fragment: &str) -> String {
    let stripped = body_fragment
        .replace("<p>", "")
        .replace("</p>", "\n\n")
        .replace("<br>", "\n")
        .replace("<br/>", "\n")
        .replace("<strong>", "")
        .replace("</strong>", "")
        .replace("<em>", "")
        .replace("</em>", "");

    format!(
        "Hi {},\n\n{}\nView grant: {}\n\n-- GrantRadar",
        user.display_name(),
        stripped.trim(),
        grant.url,
    )
}

/// Prompt for the digest intro sentence
pub fn digest_intro_prompt(user: &UserRecord, payloads: &[AlertPayload]) -> String {
    let top: Vec<String> = payloads
        .iter()
        .take(3)
        .map(|p| {
            format!(
                "{} ({}) - {}% match",
                p.grant.title,
                p.grant.funding_agency.as_deref().unwrap_or("unknown"),
                score_pct(&p.match_info),
            )
        })
        .collect();

    format!(
        "Write a brief, friendly intro paragraph (2-3 sentences) for a grant \
         digest email to {}. They have {} new grant match{}. Top matches: {}. \
         Keep it professional but warm. Don't list the grants, just intro the digest.",
        user.display_name(),
        payloads.len(),
        if payloads.len() == 1 { "" } else { "es" },
        top.join("; "),
    )
}

/// Fixed digest greeting used when the LLM is unavailable
pub fn digest_intro_fallback(user: &UserRecord, count: usize) -> String {
    format!(
        "Hi {}, we found {} new grant{} that match your research profile.",
        user.display_name(),
        count,
        if count == 1 { "" } else { "s" },
    )
}

/// One digest entry as an HTML block
pub fn digest_entry_html(payload: &AlertPayload) -> String {
    format!(
        r#"<div style="border: 1px solid #e5e7eb; border-radius: 8px; padding: 16px; margin-bottom: 16px;">
  <h3 style="margin: 0; font-size: 16px;">{title} <span style="background: #10b981; color: white; padding: 2px 8px; border-radius: 12px; font-size: 12px;">{pct}%</span></h3>
  <p style="color: #6b7280; margin: 4px 0; font-size: 14px;">{agency} &middot; Deadline: {deadline}</p>
  <p style="margin: 8px 0 12px; font-size: 14px;">{explanation}</p>
  <a href="{url}" style="color: #4f46e5; font-size: 14px;">View Details</a>
</div>"#,
        title = payload.grant.title,
        pct = score_pct(&payload.match_info),
        agency = payload.grant.funding_agency.as_deref().unwrap_or("Unknown Agency"),
        deadline = deadline_long(payload.grant.deadline),
        explanation = payload
            .match_info
            .explanation
            .as_deref()
            .unwrap_or("Strong alignment with your research profile."),
        url = payload.grant.url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use grantradar_storage::NotificationPreferences;
    use uuid::Uuid;

    fn grant(title: &str) -> GrantRecord {
        GrantRecord {
            grant_id: Uuid::new_v4(),
            source: "nih".to_string(),
            sources: vec!["nih".to_string()],
            external_id: "R01-1".to_string(),
            title: title.to_string(),
            description: Some("details".to_string()),
            url: "https://app.grantradar.io/g/1".to_string(),
            funding_agency: Some("NIH".to_string()),
            amount_min: None,
            amount_max: Some(500_000.0),
            deadline: None,
            eligibility: None,
            categories: vec![],
            keywords: vec![],
            quality_score: 90.0,
            confidence_score: 1.0,
            embedding: None,
            posted_at: None,
            discovered_at: Utc::now(),
            validated_at: Utc::now(),
        }
    }

    fn match_info(score: f64) -> MatchInfo {
        MatchInfo {
            match_id: Uuid::new_v4(),
            match_score: score,
            matching_criteria: vec!["oncology fit".to_string()],
            explanation: Some("Strong oncology overlap".to_string()),
        }
    }

    fn user() -> UserRecord {
        UserRecord {
            user_id: Uuid::new_v4(),
            name: Some("Dr. Smith".to_string()),
            email: "smith@lab.edu".to_string(),
            phone: None,
            slack_webhook_url: None,
            preferences: NotificationPreferences::default(),
        }
    }

    #[test]
    fn sms_fits_the_hard_limit() {
        let long_title = "An Extremely Long Grant Title About Interdisciplinary \
                          Research Into Many Things At Once Including More Words";
        let text = sms_text(&grant(long_title), &match_info(0.92), "https://gr.io/g/1");

        assert!(text.chars().count() <= 160, "sms too long: {}", text.len());
        assert!(text.contains("..."));
        assert!(text.contains("92%"));
    }

    #[test]
    fn short_titles_are_not_truncated() {
        let text = sms_text(&grant("Short Title"), &match_info(0.90), "https://gr.io/g/1");
        assert!(text.contains("Short Title"));
        assert!(!text.contains("Short Title..."));
    }

    #[test]
    fn sms_title_cut_happens_at_fifty_chars() {
        let title = "x".repeat(60);
        let text = sms_text(&grant(&title), &match_info(0.9), "u");
        assert!(text.contains(&format!("{}...", "x".repeat(50))));
    }

    #[test]
    fn slack_blocks_carry_score_and_button() {
        let blocks = slack_blocks(&grant("Title"), &match_info(0.88));
        let rendered = blocks.to_string();
        assert!(rendered.contains("New Grant Match: 88%"));
        assert!(rendered.contains("View Grant Details"));
        assert!(rendered.contains("https://app.grantradar.io/g/1"));
    }

    #[test]
    fn fallback_subject_stays_under_limit() {
        let long_title = "t".repeat(200);
        let subject = fallback_subject(&grant(&long_title), &match_info(0.91));
        assert!(subject.chars().count() <= 100);
        assert!(subject.starts_with("91% grant match"));
    }

    #[test]
    fn email_text_strips_html() {
        let text = email_text(
            &user(),
            &grant("Title"),
            "<p>Hello <strong>there</strong></p>",
        );
        assert!(text.contains("Hello there"));
        assert!(!text.contains("<p>"));
        assert!(text.starts_with("Hi Dr. Smith"));
    }

    #[test]
    fn digest_fallback_pluralizes() {
        assert!(digest_intro_fallback(&user(), 1).contains("1 new grant that"));
        assert!(digest_intro_fallback(&user(), 4).contains("4 new grants that"));
    }
}
