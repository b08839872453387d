//! Ephemeral keyspace helpers
//!
//! The bus side carries a handful of non-stream structures: seen-hash sets
//! for discovery dedup, last-check stamps, the bounded recent-validated
//! list, per-user digest lists, and agent heartbeat keys. All of them are
//! append-or-trim only (see the shared-resource policy).

use crate::bus::BusError;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

/// Seen-grant hashes expire after 30 days
pub const SEEN_TTL_SECS: u64 = 60 * 60 * 24 * 30;
/// The recent-validated list is trimmed to this many entries
pub const RECENT_VALIDATED_LIMIT: usize = 1000;
/// Bounded list of recently validated grants, feeding cheap dedup
pub const RECENT_VALIDATED_KEY: &str = "grants:validated:recent";

/// Key for a source's seen-hash set
pub fn seen_key(source: &str) -> String {
    format!("grants:seen:{source}")
}

/// Key for a source's last successful check timestamp
pub fn last_check_key(source: &str) -> String {
    format!("discovery:last_check:{source}")
}

/// Key for a source's filtered-page content hash
pub fn page_hash_key(source: &str) -> String {
    format!("discovery:page_hash:{source}")
}

/// Key for an agent's heartbeat timestamp
pub fn heartbeat_key(agent: &str) -> String {
    format!("agents:heartbeat:{agent}")
}

/// Key for a user's pending digest list for a given day
pub fn digest_key(user_id: &str, date: &str) -> String {
    format!("digest:pending:{user_id}:{date}")
}

/// Keyspace helper handle, cheap to clone
#[derive(Clone)]
pub struct KvStore {
    conn: ConnectionManager,
}

impl KvStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Add a member to a set and refresh its TTL. Returns true when the
    /// member was newly added.
    pub async fn set_add_with_ttl(
        &self,
        key: &str,
        member: &str,
        ttl_secs: u64,
    ) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.sadd(key, member).await?;
        let _: u64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    /// Whether a member is present in a set
    pub async fn set_contains(&self, key: &str, member: &str) -> Result<bool, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    /// Read a string key
    pub async fn get_string(&self, key: &str) -> Result<Option<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    /// Write a string key
    pub async fn set_string(&self, key: &str, value: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    /// Write a string key with a TTL
    pub async fn set_string_ex(
        &self,
        key: &str,
        value: &str,
        ttl_secs: u64,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl_secs)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Prepend to a list and trim it to `max_len`
    pub async fn list_push_trim(
        &self,
        key: &str,
        value: &str,
        max_len: usize,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.lpush(key, value).await?;
        let _: () = conn.ltrim(key, 0, max_len as isize - 1).await?;
        Ok(())
    }

    /// Prepend to a list and set an absolute expiry
    pub async fn list_push_expire_at(
        &self,
        key: &str,
        value: &str,
        expire_at: DateTime<Utc>,
    ) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.lpush(key, value).await?;
        let _: u64 = redis::cmd("EXPIREAT")
            .arg(key)
            .arg(expire_at.timestamp())
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Read a full list
    pub async fn list_range(&self, key: &str, limit: usize) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, 0, limit as isize - 1).await?)
    }

    /// Current length of a list
    pub async fn list_len(&self, key: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        Ok(conn.llen(key).await?)
    }

    /// Delete a key
    pub async fn delete(&self, key: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.del(key).await?;
        Ok(())
    }

    /// Scan for keys matching a pattern. Used sparingly (digest sweep,
    /// pipeline state scan) on bounded keyspaces.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, BusError> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(keys)
    }

    /// Record a heartbeat for an agent. Written after every successfully
    /// completed task; the health checker reads staleness from it.
    pub async fn write_heartbeat(&self, agent: &str) -> Result<(), BusError> {
        let now = Utc::now().to_rfc3339();
        self.set_string(&heartbeat_key(agent), &now).await?;
        debug!(agent, "heartbeat recorded");
        Ok(())
    }

    /// Read an agent's last heartbeat
    pub async fn read_heartbeat(&self, agent: &str) -> Result<Option<DateTime<Utc>>, BusError> {
        let raw = self.get_string(&heartbeat_key(agent)).await?;
        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layouts_are_stable() {
        assert_eq!(seen_key("nsf"), "grants:seen:nsf");
        assert_eq!(last_check_key("grants_gov"), "discovery:last_check:grants_gov");
        assert_eq!(heartbeat_key("matching"), "agents:heartbeat:matching");
        assert_eq!(
            digest_key("9a1bfa72", "2026-08-01"),
            "digest:pending:9a1bfa72:2026-08-01"
        );
    }
}
