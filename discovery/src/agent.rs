//! Shared discovery agent
//!
//! Wraps a source-specific fetcher with the common cycle: fetch since the
//! last successful check, drop grants already in the source's seen set,
//! mark the rest seen, publish, and only then advance the last-check
//! stamp. A failed cycle leaves the stamp untouched so the next run
//! re-covers the same window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use grantradar_events::kv::{last_check_key, seen_key, SEEN_TTL_SECS};
use grantradar_events::{DiscoveredGrant, EventBus, KvStore, DISCOVERED_STREAM};
use grantradar_resilience::CircuitBreaker;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};

/// Discovery failure modes
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("http request failed: {0}")]
    Http(String),

    #[error("source returned HTTP {0}")]
    Status(u16),

    #[error("failed to parse source response: {0}")]
    Parse(String),

    #[error("circuit breaker open for source {0}")]
    CircuitOpen(String),

    #[error("bus error: {0}")]
    Bus(#[from] grantradar_events::BusError),
}

/// A pluggable grant source.
///
/// Implementations fetch raw data and normalize it; everything else
/// (dedup, seen tracking, publishing, check stamps) lives in the agent.
#[async_trait]
pub trait GrantSource: Send + Sync {
    /// Unique source identifier, e.g. `nsf`, `nih`, `grants_gov`
    fn name(&self) -> &str;

    /// Fetch grants added or updated since `last_check`
    async fn fetch_since(
        &self,
        last_check: Option<DateTime<Utc>>,
    ) -> Result<Vec<DiscoveredGrant>, SourceError>;
}

/// Dedup hash over the grant identity tuple
pub fn grant_hash(source: &str, external_id: &str, title: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{source}:{external_id}:{title}").as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Discovery agent driving one source
pub struct DiscoveryAgent<S: GrantSource> {
    source: S,
    bus: EventBus,
    kv: KvStore,
    breaker: Arc<CircuitBreaker>,
}

impl<S: GrantSource> DiscoveryAgent<S> {
    pub fn new(source: S, bus: EventBus, kv: KvStore, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            source,
            bus,
            kv,
            breaker,
        }
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// Last successful check time for this source
    pub async fn last_check_time(&self) -> Result<Option<DateTime<Utc>>, SourceError> {
        let raw = self
            .kv
            .get_string(&last_check_key(self.source.name()))
            .await?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn set_last_check_time(&self, at: DateTime<Utc>) -> Result<(), SourceError> {
        self.kv
            .set_string(&last_check_key(self.source.name()), &at.to_rfc3339())
            .await?;
        Ok(())
    }

    /// Whether this grant identity was already published within the seen
    /// window
    pub async fn is_duplicate(&self, external_id: &str, title: &str) -> Result<bool, SourceError> {
        let hash = grant_hash(self.source.name(), external_id, title);
        Ok(self
            .kv
            .set_contains(&seen_key(self.source.name()), &hash)
            .await?)
    }

    async fn mark_as_seen(&self, external_id: &str, title: &str) -> Result<(), SourceError> {
        let hash = grant_hash(self.source.name(), external_id, title);
        self.kv
            .set_add_with_ttl(&seen_key(self.source.name()), &hash, SEEN_TTL_SECS)
            .await?;
        Ok(())
    }

    /// Fetch and dedup one cycle's worth of grants without publishing.
    pub async fn discover(&self) -> Result<Vec<DiscoveredGrant>, SourceError> {
        if !self.breaker.can_execute() {
            return Err(SourceError::CircuitOpen(self.source.name().to_string()));
        }

        let last_check = self.last_check_time().await?;
        let fetched = match self.source.fetch_since(last_check).await {
            Ok(fetched) => {
                self.breaker.record_success();
                fetched
            }
            Err(err) => {
                self.breaker.record_failure();
                return Err(err);
            }
        };

        let mut fresh = Vec::new();
        let mut duplicates = 0usize;

        for grant in fetched {
            if self.is_duplicate(&grant.external_id, &grant.title).await? {
                duplicates += 1;
                continue;
            }
            self.mark_as_seen(&grant.external_id, &grant.title).await?;
            fresh.push(grant);
        }

        info!(
            source = self.source.name(),
            fetched = fresh.len() + duplicates,
            duplicates,
            new = fresh.len(),
            "discovery cycle fetched"
        );

        Ok(fresh)
    }

    /// Full discovery cycle: discover, publish, advance the check stamp,
    /// heartbeat. Returns the number of newly published grants.
    pub async fn run(&self) -> Result<usize, SourceError> {
        let cycle_started = Utc::now();
        let grants = self.discover().await?;

        let mut published = 0usize;
        for grant in &grants {
            match self.bus.publish(DISCOVERED_STREAM, grant).await {
                Ok(message_id) => {
                    published += 1;
                    info!(
                        source = self.source.name(),
                        external_id = %grant.external_id,
                        message_id = %message_id,
                        "grant published"
                    );
                }
                Err(err) => {
                    // Partial publish failure: the grant stays in the seen
                    // set and will not be re-fetched this window
                    warn!(
                        source = self.source.name(),
                        external_id = %grant.external_id,
                        error = %err,
                        "grant publish failed"
                    );
                }
            }
        }

        self.set_last_check_time(cycle_started).await?;
        self.kv.write_heartbeat("discovery").await?;

        info!(
            source = self.source.name(),
            published, "discovery cycle complete"
        );
        Ok(published)
    }
}
