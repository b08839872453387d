//! Alert routing model
//!
//! Priority derives from the normalized match score and deadline
//! proximity; the channel set derives from priority and is then
//! intersected with the user's enabled channels.

use chrono::{DateTime, Utc};
use grantradar_storage::{GrantRecord, NotificationPreferences, UserRecord};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert priority levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    /// >95% match with a deadline inside 14 days: all channels
    Critical,
    /// 85%+ match: email and slack
    High,
    /// 70-85% match: email, digest-eligible
    Medium,
    /// Below threshold: no alert
    Low,
}

/// Delivery channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryChannel {
    Email,
    Sms,
    Slack,
}

impl DeliveryChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryChannel::Email => "email",
            DeliveryChannel::Sms => "sms",
            DeliveryChannel::Slack => "slack",
        }
    }
}

/// Match facts carried into content generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchInfo {
    pub match_id: Uuid,
    /// Normalized to [0, 1]
    pub match_score: f64,
    #[serde(default)]
    pub matching_criteria: Vec<String>,
    #[serde(default)]
    pub explanation: Option<String>,
}

/// Everything needed to deliver one alert, also the digest list payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertPayload {
    pub match_id: Uuid,
    pub user: UserRecord,
    pub grant: GrantRecord,
    pub match_info: MatchInfo,
    pub priority: AlertPriority,
    pub channels: Vec<DeliveryChannel>,
    pub created_at: DateTime<Utc>,
}

/// Derive alert priority from score and deadline.
///
/// The critical tier needs both a >95% score and a deadline inside 14
/// days; scores of 85% and above are high regardless of deadline so a
/// rising score never lowers the derived priority.
pub fn determine_priority(
    match_score: f64,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AlertPriority {
    let percentage = match_score * 100.0;
    let days_to_deadline = deadline.map(|d| (d - now).num_days());

    if percentage > 95.0 {
        if let Some(days) = days_to_deadline {
            if days < 14 {
                return AlertPriority::Critical;
            }
        }
    }

    if percentage >= 85.0 {
        return AlertPriority::High;
    }
    if percentage >= 70.0 {
        return AlertPriority::Medium;
    }

    AlertPriority::Low
}

/// Default channel set per priority
pub fn default_channels(priority: AlertPriority) -> Vec<DeliveryChannel> {
    match priority {
        AlertPriority::Critical => vec![
            DeliveryChannel::Email,
            DeliveryChannel::Sms,
            DeliveryChannel::Slack,
        ],
        AlertPriority::High => vec![DeliveryChannel::Email, DeliveryChannel::Slack],
        AlertPriority::Medium => vec![DeliveryChannel::Email],
        AlertPriority::Low => vec![],
    }
}

/// Intersect the default channel set with the user's enabled channels
pub fn enabled_channels(
    priority: AlertPriority,
    preferences: &NotificationPreferences,
) -> Vec<DeliveryChannel> {
    default_channels(priority)
        .into_iter()
        .filter(|channel| match channel {
            DeliveryChannel::Email => preferences.email_notifications,
            DeliveryChannel::Sms => preferences.sms_notifications,
            DeliveryChannel::Slack => preferences.slack_notifications,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn critical_needs_high_score_and_close_deadline() {
        let now = Utc::now();
        let close = Some(now + Duration::days(5));
        let distant = Some(now + Duration::days(60));

        assert_eq!(determine_priority(0.96, close, now), AlertPriority::Critical);
        assert_eq!(determine_priority(0.96, distant, now), AlertPriority::High);
        assert_eq!(determine_priority(0.96, None, now), AlertPriority::High);
        assert_eq!(determine_priority(0.90, close, now), AlertPriority::High);
    }

    #[test]
    fn score_bands_map_to_priorities() {
        let now = Utc::now();
        assert_eq!(determine_priority(0.90, None, now), AlertPriority::High);
        assert_eq!(determine_priority(0.85, None, now), AlertPriority::High);
        assert_eq!(determine_priority(0.80, None, now), AlertPriority::Medium);
        assert_eq!(determine_priority(0.70, None, now), AlertPriority::Medium);
        assert_eq!(determine_priority(0.69, None, now), AlertPriority::Low);
    }

    #[test]
    fn priority_never_drops_as_score_rises() {
        let now = Utc::now();
        let deadline = Some(now + Duration::days(3));
        let rank = |p: AlertPriority| match p {
            AlertPriority::Low => 0,
            AlertPriority::Medium => 1,
            AlertPriority::High => 2,
            AlertPriority::Critical => 3,
        };

        let mut previous = 0;
        for score in [0.5, 0.7, 0.8, 0.85, 0.9, 0.95, 0.96, 1.0] {
            let current = rank(determine_priority(score, deadline, now));
            assert!(current >= previous, "priority dropped at score {score}");
            previous = current;
        }
    }

    #[test]
    fn default_channel_sets_per_priority() {
        assert_eq!(default_channels(AlertPriority::Critical).len(), 3);
        assert_eq!(
            default_channels(AlertPriority::High),
            vec![DeliveryChannel::Email, DeliveryChannel::Slack]
        );
        assert_eq!(
            default_channels(AlertPriority::Medium),
            vec![DeliveryChannel::Email]
        );
        assert!(default_channels(AlertPriority::Low).is_empty());
    }

    #[test]
    fn user_preferences_filter_channels() {
        let prefs = NotificationPreferences {
            email_notifications: true,
            sms_notifications: false,
            slack_notifications: true,
            digest_frequency: "immediate".to_string(),
            minimum_match_score: 0.7,
        };

        let channels = enabled_channels(AlertPriority::Critical, &prefs);
        assert_eq!(channels, vec![DeliveryChannel::Email, DeliveryChannel::Slack]);
    }

    #[test]
    fn all_channels_disabled_yields_empty_set() {
        let prefs = NotificationPreferences {
            email_notifications: false,
            sms_notifications: false,
            slack_notifications: false,
            digest_frequency: "immediate".to_string(),
            minimum_match_score: 0.7,
        };
        assert!(enabled_channels(AlertPriority::Critical, &prefs).is_empty());
    }
}
