//! Metric sample recording
//!
//! Agents write latency samples and counters here; the orchestrator's
//! collector aggregates them. Like heartbeats and pipeline state, the flow
//! is strictly one-way: agents write, the orchestrator reads.
//!
//! Layout: sorted sets hold time-series samples scored by unix time with
//! TTL-style cleanup on write; counters are per-hour keys that expire at
//! twice the window.

use crate::bus::BusError;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use serde_json::json;

/// Per-stage pipeline latency samples: `metrics:pipeline:latencies:<stage>`
pub const PIPELINE_LATENCIES_KEY: &str = "metrics:pipeline:latencies";
/// Per-agent latency samples: `metrics:agent:<agent>:latencies`
pub fn agent_latencies_key(agent: &str) -> String {
    format!("metrics:agent:{agent}:latencies")
}
/// LLM call latency samples
pub const LLM_LATENCIES_KEY: &str = "metrics:llm:latencies";
/// Queue depth hash
pub const QUEUE_DEPTHS_KEY: &str = "metrics:queues:depths";
/// Latest system metrics snapshot
pub const SYSTEM_METRICS_KEY: &str = "metrics:system:current";

/// Latency samples are kept for 24 hours
pub const LATENCY_RETENTION_SECS: u64 = 24 * 3600;
/// Counters cover an hourly window and expire at twice the window
pub const COUNTER_TTL_SECS: u64 = 2 * 3600;
/// Metric snapshots are kept for 30 days
pub const SNAPSHOT_RETENTION_SECS: u64 = 30 * 86_400;

/// Hourly counter window key component
pub fn current_window(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H").to_string()
}

/// Daily history key component
pub fn current_date(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d").to_string()
}

pub fn pipeline_success_key(window: &str) -> String {
    format!("metrics:pipeline:success:{window}")
}

pub fn pipeline_failure_key(window: &str) -> String {
    format!("metrics:pipeline:failure:{window}")
}

pub fn agent_success_key(agent: &str, window: &str) -> String {
    format!("metrics:agent:{agent}:success:{window}")
}

pub fn agent_failure_key(agent: &str, window: &str) -> String {
    format!("metrics:agent:{agent}:failure:{window}")
}

pub fn alerts_sent_key(window: &str) -> String {
    format!("metrics:alerts:sent:{window}")
}

pub fn alerts_delivered_key(window: &str) -> String {
    format!("metrics:alerts:delivered:{window}")
}

pub fn history_key(date: &str) -> String {
    format!("metrics:history:{date}")
}

/// One-way metric sample writer used by agents
#[derive(Clone)]
pub struct MetricsWriter {
    conn: ConnectionManager,
}

impl MetricsWriter {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn add_sample(&self, key: &str, member: String) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp() as f64;

        let _: u64 = redis::cmd("ZADD")
            .arg(key)
            .arg(now)
            .arg(member)
            .query_async(&mut conn)
            .await?;

        let cutoff = now - LATENCY_RETENTION_SECS as f64;
        let _: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(0)
            .arg(cutoff)
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn bump_counter(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("INCR").arg(key).query_async(&mut conn).await?;
        let _: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(COUNTER_TTL_SECS)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Record a pipeline stage latency sample
    pub async fn record_pipeline_latency(
        &self,
        stage: &str,
        latency_secs: f64,
        grant_id: Option<&str>,
    ) -> Result<(), BusError> {
        let member = json!({
            "latency": latency_secs,
            "grant_id": grant_id,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();
        self.add_sample(&format!("{PIPELINE_LATENCIES_KEY}:{stage}"), member)
            .await
    }

    /// Record an agent task latency sample
    pub async fn record_agent_latency(
        &self,
        agent: &str,
        latency_ms: f64,
    ) -> Result<(), BusError> {
        let member = json!({
            "latency_ms": latency_ms,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();
        self.add_sample(&agent_latencies_key(agent), member).await
    }

    /// Record an LLM call latency sample
    pub async fn record_llm_latency(&self, latency_ms: f64) -> Result<(), BusError> {
        let member = json!({
            "latency_ms": latency_ms,
            "timestamp": Utc::now().to_rfc3339(),
        })
        .to_string();
        self.add_sample(LLM_LATENCIES_KEY, member).await
    }

    pub async fn record_pipeline_success(&self) -> Result<(), BusError> {
        let window = current_window(Utc::now());
        self.bump_counter(&pipeline_success_key(&window)).await
    }

    pub async fn record_pipeline_failure(&self) -> Result<(), BusError> {
        let window = current_window(Utc::now());
        self.bump_counter(&pipeline_failure_key(&window)).await
    }

    pub async fn record_agent_success(&self, agent: &str) -> Result<(), BusError> {
        let window = current_window(Utc::now());
        self.bump_counter(&agent_success_key(agent, &window)).await
    }

    pub async fn record_agent_failure(&self, agent: &str) -> Result<(), BusError> {
        let window = current_window(Utc::now());
        self.bump_counter(&agent_failure_key(agent, &window)).await
    }

    pub async fn record_alert_sent(&self) -> Result<(), BusError> {
        let window = current_window(Utc::now());
        self.bump_counter(&alerts_sent_key(&window)).await
    }

    pub async fn record_alert_delivered(&self) -> Result<(), BusError> {
        let window = current_window(Utc::now());
        self.bump_counter(&alerts_delivered_key(&window)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn window_keys_are_hourly() {
        let at = Utc.with_ymd_and_hms(2026, 8, 1, 14, 30, 0).unwrap();
        assert_eq!(current_window(at), "2026080114");
        assert_eq!(current_date(at), "20260801");
    }

    #[test]
    fn key_layout_is_stable() {
        assert_eq!(
            pipeline_success_key("2026080114"),
            "metrics:pipeline:success:2026080114"
        );
        assert_eq!(
            agent_failure_key("curation", "2026080114"),
            "metrics:agent:curation:failure:2026080114"
        );
        assert_eq!(agent_latencies_key("matching"), "metrics:agent:matching:latencies");
    }
}
