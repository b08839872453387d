//! Durable event bus over Redis streams
//!
//! Streams are append-only and persist after acknowledgment; consumer
//! groups track delivery independently. Unacknowledged messages stay in the
//! group's pending-entries list and can be claimed by another consumer
//! after a visibility timeout.

use crate::envelope::{dlq_stream, DeadLetterEvent, EVENT_VERSION};
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::streams::{StreamPendingReply, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bus operation errors
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// One message read from a stream
#[derive(Debug, Clone)]
pub struct StreamMessage {
    /// Stream entry id assigned by the bus
    pub id: String,
    /// The raw JSON envelope from the `data` field
    pub data: String,
}

impl StreamMessage {
    /// Parse the envelope into a typed event
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.data)
    }

    /// The envelope as loosely typed JSON, for DLQ payload capture
    pub fn as_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or(serde_json::Value::Null)
    }
}

/// Event bus handle, cheap to clone and share between workers
#[derive(Clone)]
pub struct EventBus {
    conn: ConnectionManager,
}

impl EventBus {
    /// Connect to the bus
    pub async fn connect(redis_url: &str) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("event bus connected");
        Ok(Self { conn })
    }

    /// Build from an existing connection manager
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// A clone of the underlying connection, for callers that need raw
    /// commands (metrics storage, keyspace helpers).
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Round-trip latency of a PING in milliseconds
    pub async fn ping(&self) -> Result<f64, BusError> {
        let mut conn = self.conn.clone();
        let start = Instant::now();
        redis::cmd("PING").query_async::<_, String>(&mut conn).await?;
        Ok(start.elapsed().as_secs_f64() * 1000.0)
    }

    /// Publish an envelope to a stream. Returns the assigned message id.
    pub async fn publish<T: Serialize>(
        &self,
        stream: &str,
        payload: &T,
    ) -> Result<String, BusError> {
        let data = serde_json::to_string(payload)?;
        let mut conn = self.conn.clone();
        let id: String = conn.xadd(stream, "*", &[("data", data.as_str())]).await?;
        debug!(stream, message_id = %id, "envelope published");
        Ok(id)
    }

    /// Create a consumer group, tolerating one that already exists.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let result: Result<String, redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => {
                info!(stream, group, "consumer group created");
                Ok(())
            }
            Err(err) if err.to_string().contains("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Read new messages for a consumer, blocking up to `block_ms`.
    ///
    /// Pass `new_only = false` to drain this consumer's own pending entries
    /// instead (used once at startup so a restarted worker re-processes
    /// messages it read but never acknowledged).
    pub async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: usize,
        new_only: bool,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let mut conn = self.conn.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms);
        let cursor = if new_only { ">" } else { "0" };

        let reply: StreamReadReply = conn.xread_options(&[stream], &[cursor], &options).await?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                match entry.map.get("data") {
                    Some(value) => {
                        let data: String = redis::from_redis_value(value)?;
                        messages.push(StreamMessage { id: entry.id, data });
                    }
                    None => {
                        warn!(stream, message_id = %entry.id, "message missing data field");
                        messages.push(StreamMessage {
                            id: entry.id,
                            data: String::new(),
                        });
                    }
                }
            }
        }

        Ok(messages)
    }

    /// Acknowledge a processed message
    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn.xack(stream, group, &[id]).await?;
        Ok(())
    }

    /// Number of pending (delivered, unacknowledged) entries for a group
    pub async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BusError> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingReply = conn.xpending(stream, group).await?;
        Ok(match reply {
            StreamPendingReply::Empty => 0,
            StreamPendingReply::Data(data) => data.count as u64,
        })
    }

    /// Claim entries idle longer than `min_idle_ms` for this consumer.
    ///
    /// Used by workers to pick up messages abandoned by a crashed peer after
    /// the visibility timeout.
    pub async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        count: usize,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let mut conn = self.conn.clone();
        let reply: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(parse_autoclaim_entries(&reply))
    }

    /// Trim a stream to approximately `max_len` entries
    pub async fn trim(&self, stream: &str, max_len: usize) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(max_len)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Move a failed envelope to the stream's dead-letter queue.
    pub async fn dead_letter(
        &self,
        original_stream: &str,
        original_message_id: &str,
        original_payload: serde_json::Value,
        error_message: &str,
        error_type: &str,
        failure_count: u32,
        first_failure_at: DateTime<Utc>,
    ) -> Result<String, BusError> {
        let event = DeadLetterEvent {
            event_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version: EVENT_VERSION.to_string(),
            original_stream: original_stream.to_string(),
            original_message_id: original_message_id.to_string(),
            original_payload,
            error_message: error_message.to_string(),
            error_type: error_type.to_string(),
            failure_count,
            first_failure_at,
            last_failure_at: Utc::now(),
        };

        let dlq = dlq_stream(original_stream);
        let id = self.publish(&dlq, &event).await?;
        warn!(
            stream = original_stream,
            message_id = original_message_id,
            error_type,
            "envelope dead-lettered"
        );
        Ok(id)
    }
}

/// Parse the entries array of an XAUTOCLAIM reply: `[cursor, [[id, [k, v,
/// ...]], ...], deleted]`. Malformed entries are skipped.
fn parse_autoclaim_entries(reply: &redis::Value) -> Vec<StreamMessage> {
    let mut messages = Vec::new();

    let redis::Value::Bulk(parts) = reply else {
        return messages;
    };
    let Some(redis::Value::Bulk(entries)) = parts.get(1) else {
        return messages;
    };

    for entry in entries {
        let redis::Value::Bulk(pair) = entry else {
            continue;
        };
        let (Some(id_value), Some(redis::Value::Bulk(fields))) = (pair.first(), pair.get(1))
        else {
            continue;
        };
        let Ok(id) = redis::from_redis_value::<String>(id_value) else {
            continue;
        };

        let mut data = String::new();
        for chunk in fields.chunks(2) {
            if let [name, value] = chunk {
                let field: String = redis::from_redis_value(name).unwrap_or_default();
                if field == "data" {
                    data = redis::from_redis_value(value).unwrap_or_default();
                }
            }
        }

        messages.push(StreamMessage { id, data });
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bulk_string(s: &str) -> redis::Value {
        redis::Value::Data(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_autoclaim_reply() {
        let reply = redis::Value::Bulk(vec![
            bulk_string("0-0"),
            redis::Value::Bulk(vec![redis::Value::Bulk(vec![
                bulk_string("1-1"),
                redis::Value::Bulk(vec![bulk_string("data"), bulk_string("{\"a\":1}")]),
            ])]),
            redis::Value::Bulk(vec![]),
        ]);

        let messages = parse_autoclaim_entries(&reply);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "1-1");
        assert_eq!(messages[0].data, "{\"a\":1}");
    }

    #[test]
    fn skips_malformed_autoclaim_entries() {
        let reply = redis::Value::Bulk(vec![
            bulk_string("0-0"),
            redis::Value::Bulk(vec![redis::Value::Nil, bulk_string("not-an-entry")]),
        ]);
        assert!(parse_autoclaim_entries(&reply).is_empty());
    }

    #[test]
    fn stream_message_parses_typed_envelopes() {
        let msg = StreamMessage {
            id: "1-1".to_string(),
            data: "{\"value\": 3}".to_string(),
        };

        #[derive(serde::Deserialize)]
        struct Payload {
            value: u32,
        }

        let payload: Payload = msg.parse().unwrap();
        assert_eq!(payload.value, 3);
        assert!(msg.as_value().is_object());
    }

    #[test]
    fn unparseable_data_becomes_null_value() {
        let msg = StreamMessage {
            id: "1-1".to_string(),
            data: "not json".to_string(),
        };
        assert!(msg.as_value().is_null());
    }
}
