//! Bounded latency sample window with percentile calculations
//!
//! Keeps the most recent N samples. Feeds the health checker's per-endpoint
//! statistics and the LLM failover's slow-call detection.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Aggregated latency statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyStats {
    pub avg_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
}

/// Sliding window of latency samples in milliseconds
#[derive(Debug, Clone)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl LatencyWindow {
    /// Create a window retaining at most `capacity` samples
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record a sample, evicting the oldest when full
    pub fn record(&mut self, latency_ms: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Number of retained samples
    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Drop all samples
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Mean of retained samples, 0.0 when empty
    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<f64>() / self.samples.len() as f64
    }

    /// Latency at percentile `p` (0-100), 0.0 when empty
    pub fn percentile(&self, p: f64) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((p / 100.0) * sorted.len() as f64) as usize;
        sorted[index.min(sorted.len() - 1)]
    }

    /// Full statistics snapshot
    pub fn stats(&self) -> LatencyStats {
        LatencyStats {
            avg_ms: round2(self.mean()),
            p50_ms: round2(self.percentile(50.0)),
            p95_ms: round2(self.percentile(95.0)),
            p99_ms: round2(self.percentile(99.0)),
            sample_count: self.count(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_reports_zero() {
        let window = LatencyWindow::new(10);
        assert_eq!(window.mean(), 0.0);
        assert_eq!(window.percentile(95.0), 0.0);
        assert_eq!(window.count(), 0);
    }

    #[test]
    fn mean_and_percentiles() {
        let mut window = LatencyWindow::new(100);
        for ms in 1..=100 {
            window.record(ms as f64);
        }

        assert_eq!(window.mean(), 50.5);
        assert_eq!(window.percentile(95.0), 96.0);
        assert_eq!(window.percentile(99.0), 100.0);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut window = LatencyWindow::new(3);
        window.record(1.0);
        window.record(2.0);
        window.record(3.0);
        window.record(100.0);

        assert_eq!(window.count(), 3);
        assert_eq!(window.mean(), 35.0);
    }

    #[test]
    fn slow_tail_detection_over_small_window() {
        // The LLM failover keeps 10 samples and looks at the mean
        let mut window = LatencyWindow::new(10);
        for _ in 0..10 {
            window.record(12_000.0);
        }
        assert!(window.mean() > 10_000.0);
    }
}
