//! In-memory response cache for deterministic LLM prompts
//!
//! Categorization and duplicate-confirmation prompts are pure functions of
//! their inputs, so identical prompts within the TTL reuse the previous
//! completion instead of paying for another call. Entries are keyed by a
//! hash of the prompt and evicted LRU-style once the cache is full.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Entry {
    value: String,
    expires_at: Instant,
    last_accessed: Instant,
}

/// Bounded TTL cache for prompt responses
pub struct ResponseCache {
    entries: Mutex<HashMap<u64, Entry>>,
    max_entries: usize,
    ttl: Duration,
    stats: Mutex<CacheStats>,
}

impl ResponseCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_entries: max_entries.max(1),
            ttl,
            stats: Mutex::new(CacheStats::default()),
        }
    }

    fn key(prompt: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        prompt.hash(&mut hasher);
        hasher.finish()
    }

    /// Look up a cached response for a prompt
    pub fn get(&self, prompt: &str) -> Option<String> {
        let key = Self::key(prompt);
        let now = Instant::now();

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let hit = match entries.get_mut(&key) {
            Some(entry) if entry.expires_at > now => {
                entry.last_accessed = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        };

        if let Ok(mut stats) = self.stats.lock() {
            if hit.is_some() {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }

        hit
    }

    /// Store a response, evicting the least recently used entry when full
    pub fn put(&self, prompt: &str, value: String) {
        let key = Self::key(prompt);
        let now = Instant::now();

        let mut entries = match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if entries.len() >= self.max_entries && !entries.contains_key(&key) {
            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_accessed)
                .map(|(k, _)| *k);
            if let Some(lru_key) = lru {
                entries.remove(&lru_key);
                if let Ok(mut stats) = self.stats.lock() {
                    stats.evictions += 1;
                }
            }
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + self.ttl,
                last_accessed: now,
            },
        );
        debug!(entries = entries.len(), "llm response cached");
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .lock()
            .map(|s| *s)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_after_put_hits() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        assert!(cache.get("categorize: title").is_none());

        cache.put("categorize: title", "[\"Biomedical\"]".to_string());
        assert_eq!(
            cache.get("categorize: title").as_deref(),
            Some("[\"Biomedical\"]")
        );

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn expired_entries_miss() {
        let cache = ResponseCache::new(10, Duration::from_millis(0));
        cache.put("p", "v".to_string());
        assert!(cache.get("p").is_none());
    }

    #[test]
    fn full_cache_evicts_least_recently_used() {
        let cache = ResponseCache::new(2, Duration::from_secs(60));
        cache.put("a", "1".to_string());
        cache.put("b", "2".to_string());

        // Touch "a" so "b" is the eviction candidate
        assert!(cache.get("a").is_some());
        cache.put("c", "3".to_string());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn distinct_prompts_do_not_collide() {
        let cache = ResponseCache::new(10, Duration::from_secs(60));
        cache.put("prompt one", "1".to_string());
        cache.put("prompt two", "2".to_string());
        assert_eq!(cache.get("prompt one").as_deref(), Some("1"));
        assert_eq!(cache.get("prompt two").as_deref(), Some("2"));
    }
}
