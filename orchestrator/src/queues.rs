//! Priority queue routing and autoscaling signals
//!
//! Maps `(match_score, deadline)` to a logical queue, assigns worker-pool
//! priority integers, and recommends scaling when total queue depth
//! crosses the thresholds.

use crate::models::WorkerScalingDecision;
use chrono::{DateTime, Utc};
use grantradar_events::KvStore;
use std::collections::HashMap;
use tracing::debug;

/// Match score (normalized) that marks a critical candidate
pub const CRITICAL_MATCH_THRESHOLD: f64 = 0.95;
/// Deadline window that marks an urgent candidate
pub const CRITICAL_DEADLINE_DAYS: i64 = 30;
/// Scale up when total depth exceeds this
pub const SCALE_UP_THRESHOLD: u64 = 100;
/// Scale down when total depth is below this
pub const SCALE_DOWN_THRESHOLD: u64 = 20;
/// Never scale below this many workers
pub const MIN_WORKERS: usize = 2;

/// The logical queues, highest priority first
pub const QUEUES: [&str; 3] = ["critical", "high", "normal"];

/// Routing decision for one task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRoute {
    pub queue: &'static str,
    pub priority: u8,
}

/// Queue name for a match
pub fn determine_queue(
    match_score: f64,
    deadline: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> &'static str {
    let is_high_match = match_score >= CRITICAL_MATCH_THRESHOLD;
    let is_urgent = deadline
        .map(|d| (d - now).num_days() <= CRITICAL_DEADLINE_DAYS)
        .unwrap_or(false);

    match (is_high_match, is_urgent) {
        (true, true) => "critical",
        (true, false) | (false, true) => "high",
        (false, false) => "normal",
    }
}

/// Worker-pool priority integer for a queue
pub fn queue_priority(queue: &str) -> u8 {
    match queue {
        "critical" => 10,
        "high" => 7,
        _ => 3,
    }
}

/// Full routing decision. Background tasks always take the normal queue
/// at the lowest priority.
pub fn route_task(
    match_score: Option<f64>,
    deadline: Option<DateTime<Utc>>,
    is_background: bool,
    now: DateTime<Utc>,
) -> TaskRoute {
    if is_background {
        return TaskRoute {
            queue: "normal",
            priority: 1,
        };
    }

    match match_score {
        Some(score) => {
            let queue = determine_queue(score, deadline, now);
            TaskRoute {
                queue,
                priority: queue_priority(queue),
            }
        }
        None => TaskRoute {
            queue: "normal",
            priority: 3,
        },
    }
}

/// Priority queue manager reading live depths from the bus side
pub struct PriorityQueueManager {
    kv: KvStore,
}

impl PriorityQueueManager {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    /// Current depth of each logical queue
    pub async fn queue_depths(&self) -> anyhow::Result<HashMap<String, u64>> {
        let mut depths = HashMap::new();
        for queue in QUEUES {
            let depth = self.kv.list_len(queue).await?;
            depths.insert(queue.to_string(), depth);
        }
        debug!(?depths, "queue depths sampled");
        Ok(depths)
    }

    /// Scaling recommendation given the current worker count, if any
    pub async fn check_scaling(
        &self,
        current_workers: usize,
    ) -> anyhow::Result<Option<WorkerScalingDecision>> {
        let depths = self.queue_depths().await?;
        let total: u64 = depths.values().sum();

        if total > SCALE_UP_THRESHOLD {
            return Ok(Some(WorkerScalingDecision {
                queue_name: "all".to_string(),
                current_workers,
                target_workers: current_workers + 2,
                reason: format!("queue depth ({total}) exceeds threshold"),
                queue_depth: total,
                threshold: SCALE_UP_THRESHOLD,
            }));
        }

        if total < SCALE_DOWN_THRESHOLD && current_workers > MIN_WORKERS {
            return Ok(Some(WorkerScalingDecision {
                queue_name: "all".to_string(),
                current_workers,
                target_workers: (current_workers - 1).max(MIN_WORKERS),
                reason: format!("queue depth ({total}) below threshold"),
                queue_depth: total,
                threshold: SCALE_DOWN_THRESHOLD,
            }));
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn high_match_and_urgent_deadline_is_critical() {
        let now = Utc::now();
        let soon = Some(now + Duration::days(10));
        assert_eq!(determine_queue(0.96, soon, now), "critical");
    }

    #[test]
    fn either_signal_alone_is_high() {
        let now = Utc::now();
        let soon = Some(now + Duration::days(10));
        let distant = Some(now + Duration::days(90));

        assert_eq!(determine_queue(0.96, distant, now), "high");
        assert_eq!(determine_queue(0.96, None, now), "high");
        assert_eq!(determine_queue(0.5, soon, now), "high");
    }

    #[test]
    fn neither_signal_is_normal() {
        let now = Utc::now();
        assert_eq!(determine_queue(0.5, None, now), "normal");
    }

    #[test]
    fn priority_integers_match_queue_tiers() {
        assert_eq!(queue_priority("critical"), 10);
        assert_eq!(queue_priority("high"), 7);
        assert_eq!(queue_priority("normal"), 3);
    }

    #[test]
    fn background_tasks_take_the_floor() {
        let route = route_task(Some(0.99), None, true, Utc::now());
        assert_eq!(route.queue, "normal");
        assert_eq!(route.priority, 1);
    }

    #[test]
    fn scoreless_tasks_route_normal() {
        let route = route_task(None, None, false, Utc::now());
        assert_eq!(
            route,
            TaskRoute {
                queue: "normal",
                priority: 3
            }
        );
    }
}
