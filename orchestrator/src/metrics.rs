//! Metrics aggregation and SLO calculation
//!
//! Reads the samples and counters that agents write through
//! `grantradar_events::metrics`, computes percentiles and rates over the
//! current window, and stores dashboard snapshots with 30-day retention.

use crate::models::{SloStatus, SystemMetrics};
use anyhow::{Context, Result};
use chrono::Utc;
use grantradar_events::metrics::{
    agent_failure_key, agent_success_key, alerts_delivered_key, alerts_sent_key, current_date,
    current_window, history_key, pipeline_failure_key, pipeline_success_key,
    LLM_LATENCIES_KEY, PIPELINE_LATENCIES_KEY, QUEUE_DEPTHS_KEY, SNAPSHOT_RETENTION_SECS,
    SYSTEM_METRICS_KEY,
};
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use tracing::debug;

/// SLO targets
pub const SLO_PIPELINE_LATENCY_SECONDS: f64 = 120.0;
pub const SLO_SUCCESS_RATE_PERCENT: f64 = 99.0;
pub const SLO_ALERT_DELIVERY_RATE_PERCENT: f64 = 99.5;
pub const SLO_LLM_LATENCY_MS: f64 = 10_000.0;

/// The agent roles whose success rates are reported
const AGENTS: [&str; 4] = ["discovery", "curation", "matching", "delivery"];

/// Metrics collector
pub struct MetricsCollector {
    conn: ConnectionManager,
}

impl MetricsCollector {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn get_counter(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .context("counter read failed")?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Percentile over the last hour of samples in a sorted set. Sample
    /// members are JSON with either a `latency` or `latency_ms` field.
    pub async fn latency_percentile(&self, key: &str, percentile: f64) -> Result<f64> {
        let mut conn = self.conn.clone();
        let now = Utc::now().timestamp() as f64;
        let cutoff = now - 3600.0;

        let entries: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(cutoff)
            .arg(now)
            .query_async(&mut conn)
            .await
            .context("latency sample read failed")?;

        let mut latencies: Vec<f64> = entries
            .iter()
            .filter_map(|entry| {
                let value: serde_json::Value = serde_json::from_str(entry).ok()?;
                value
                    .get("latency")
                    .or_else(|| value.get("latency_ms"))
                    .and_then(|v| v.as_f64())
            })
            .collect();

        if latencies.is_empty() {
            return Ok(0.0);
        }

        latencies.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((percentile / 100.0) * latencies.len() as f64) as usize;
        Ok(latencies[index.min(latencies.len() - 1)])
    }

    async fn success_rate(&self, success_key: &str, failure_key: &str) -> Result<f64> {
        let success = self.get_counter(success_key).await?;
        let failure = self.get_counter(failure_key).await?;
        let total = success + failure;

        if total == 0 {
            // No data yet defaults to healthy
            return Ok(1.0);
        }
        Ok(success as f64 / total as f64)
    }

    /// Pipeline success rate over the current window
    pub async fn pipeline_success_rate(&self) -> Result<f64> {
        let window = current_window(Utc::now());
        self.success_rate(
            &pipeline_success_key(&window),
            &pipeline_failure_key(&window),
        )
        .await
    }

    /// One agent's success rate over the current window
    pub async fn agent_success_rate(&self, agent: &str) -> Result<f64> {
        let window = current_window(Utc::now());
        self.success_rate(
            &agent_success_key(agent, &window),
            &agent_failure_key(agent, &window),
        )
        .await
    }

    /// Fraction of attempted alerts that were delivered
    pub async fn alert_delivery_rate(&self) -> Result<f64> {
        let window = current_window(Utc::now());
        let sent = self.get_counter(&alerts_sent_key(&window)).await?;
        let delivered = self.get_counter(&alerts_delivered_key(&window)).await?;

        if sent == 0 {
            return Ok(1.0);
        }
        Ok(delivered as f64 / sent as f64)
    }

    /// Persist queue depths for the dashboard
    pub async fn update_queue_depths(&self, depths: &HashMap<String, u64>) -> Result<()> {
        if depths.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HSET");
        cmd.arg(QUEUE_DEPTHS_KEY);
        for (queue, depth) in depths {
            cmd.arg(queue).arg(depth.to_string());
        }
        let _: u64 = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    /// The four SLOs with current values
    pub async fn calculate_slos(&self) -> Result<Vec<SloStatus>> {
        let p95_pipeline = self
            .latency_percentile(&format!("{PIPELINE_LATENCIES_KEY}:completed"), 95.0)
            .await?;
        let success_rate = self.pipeline_success_rate().await?;
        let delivery_rate = self.alert_delivery_rate().await?;
        let p95_llm = self.latency_percentile(LLM_LATENCIES_KEY, 95.0).await?;

        Ok(vec![
            SloStatus::create(
                "Pipeline Latency (p95)",
                SLO_PIPELINE_LATENCY_SECONDS,
                p95_pipeline,
                "seconds",
                false,
            ),
            SloStatus::create(
                "Pipeline Success Rate",
                SLO_SUCCESS_RATE_PERCENT,
                success_rate * 100.0,
                "percent",
                true,
            ),
            SloStatus::create(
                "Alert Delivery Rate",
                SLO_ALERT_DELIVERY_RATE_PERCENT,
                delivery_rate * 100.0,
                "percent",
                true,
            ),
            SloStatus::create(
                "LLM Latency (p95)",
                SLO_LLM_LATENCY_MS,
                p95_llm,
                "milliseconds",
                false,
            ),
        ])
    }

    /// Aggregate the current system metrics
    pub async fn collect_system_metrics(&self, active_pipelines: usize) -> Result<SystemMetrics> {
        let mut conn = self.conn.clone();

        let raw_depths: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(QUEUE_DEPTHS_KEY)
            .query_async(&mut conn)
            .await
            .unwrap_or_default();
        let queue_depths = raw_depths
            .into_iter()
            .filter_map(|(k, v)| v.parse().ok().map(|depth| (k, depth)))
            .collect();

        let mut stage_latencies = HashMap::new();
        for stage in ["validated", "matched", "completed"] {
            let median = self
                .latency_percentile(&format!("{PIPELINE_LATENCIES_KEY}:{stage}"), 50.0)
                .await?;
            stage_latencies.insert(stage.to_string(), median);
        }

        let mut success_rates = HashMap::new();
        for agent in AGENTS {
            success_rates.insert(agent.to_string(), self.agent_success_rate(agent).await?);
        }

        let window = current_window(Utc::now());
        let alerts_sent = self.get_counter(&alerts_sent_key(&window)).await?;

        Ok(SystemMetrics {
            timestamp: Utc::now(),
            queue_depths,
            stage_latencies,
            success_rates,
            alerts_sent,
            alert_delivery_rate: self.alert_delivery_rate().await?,
            llm_p95_latency_ms: self.latency_percentile(LLM_LATENCIES_KEY, 95.0).await?,
            active_pipelines,
        })
    }

    /// Store the latest snapshot and append it to the daily history
    pub async fn store_snapshot(&self, metrics: &SystemMetrics) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(metrics)?;

        let _: () = redis::cmd("SET")
            .arg(SYSTEM_METRICS_KEY)
            .arg(&json)
            .query_async(&mut conn)
            .await?;

        let key = history_key(&current_date(Utc::now()));
        let _: u64 = redis::cmd("RPUSH")
            .arg(&key)
            .arg(&json)
            .query_async(&mut conn)
            .await?;
        let _: bool = redis::cmd("EXPIRE")
            .arg(&key)
            .arg(SNAPSHOT_RETENTION_SECS)
            .query_async(&mut conn)
            .await?;

        debug!("metrics snapshot stored");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slo_targets_match_the_objectives() {
        assert_eq!(SLO_PIPELINE_LATENCY_SECONDS, 120.0);
        assert_eq!(SLO_SUCCESS_RATE_PERCENT, 99.0);
        assert_eq!(SLO_ALERT_DELIVERY_RATE_PERCENT, 99.5);
        assert_eq!(SLO_LLM_LATENCY_MS, 10_000.0);
    }

    #[test]
    fn latency_members_parse_both_field_names() {
        let seconds: serde_json::Value =
            serde_json::from_str(r#"{"latency": 95.2, "grant_id": null}"#).unwrap();
        let millis: serde_json::Value =
            serde_json::from_str(r#"{"latency_ms": 450.0}"#).unwrap();

        let read = |v: &serde_json::Value| {
            v.get("latency")
                .or_else(|| v.get("latency_ms"))
                .and_then(|x| x.as_f64())
        };
        assert_eq!(read(&seconds), Some(95.2));
        assert_eq!(read(&millis), Some(450.0));
    }
}
