//! Fixed-interval rate limiter
//!
//! Grants.gov allows at most one detail request per second; other sources
//! use a gentler interval. `acquire` suspends until the interval since the
//! previous call has elapsed.

use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

/// Minimum-interval limiter shared across a source's requests
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    /// One request per second
    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Wait until a request is allowed
    pub async fn acquire(&self) {
        let mut last = self.last_request.lock().await;

        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }

        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::per_second();
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_waits_for_interval() {
        let limiter = RateLimiter::per_second();
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;

        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn spaced_requests_do_not_wait() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        limiter.acquire().await;
        sleep(Duration::from_millis(150)).await;

        let before = Instant::now();
        limiter.acquire().await;
        assert_eq!(before.elapsed(), Duration::ZERO);
    }
}
