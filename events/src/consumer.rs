//! Shared consumer loop
//!
//! Each agent role runs this loop against its stream and consumer group.
//! The loop drains the consumer's own pending entries once at startup (a
//! restarted worker re-processes what it read but never acked), then reads
//! new messages with a bounded block so shutdown latency stays bounded.
//!
//! Disposition semantics:
//! - `Ack`: the message was handled (including deliberate skips).
//! - `DeadLetter`: unrecoverable; the original is acked and republished to
//!   `dlq:<stream>` to avoid head-of-line blocking.
//! - `Retry`: transient; the message stays pending and is redelivered.

use crate::bus::{EventBus, StreamMessage};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Consumer loop configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream: String,
    pub group: String,
    pub consumer_name: String,
    /// Max messages per read
    pub count: usize,
    /// Stream read block in milliseconds
    pub block_ms: usize,
    /// Idle time before stealing a crashed peer's pending entries
    pub claim_idle_ms: u64,
}

impl ConsumerConfig {
    pub fn new(stream: &str, group: &str, consumer_name: &str) -> Self {
        Self {
            stream: stream.to_string(),
            group: group.to_string(),
            consumer_name: consumer_name.to_string(),
            count: 10,
            block_ms: 5_000,
            claim_idle_ms: 300_000,
        }
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }
}

/// What to do with a message after handling
#[derive(Debug, Clone)]
pub enum Disposition {
    /// Acknowledge; processing finished or was deliberately skipped
    Ack,
    /// Acknowledge and move to the dead-letter stream
    DeadLetter { error_type: String, message: String },
    /// Leave pending for redelivery
    Retry,
}

/// Message handler implemented by each agent
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn handle(&self, message: &StreamMessage) -> Disposition;
}

async fn dispatch<H: EnvelopeHandler>(
    bus: &EventBus,
    config: &ConsumerConfig,
    handler: &H,
    message: &StreamMessage,
) {
    let disposition = handler.handle(message).await;

    match disposition {
        Disposition::Ack => {
            if let Err(err) = bus.ack(&config.stream, &config.group, &message.id).await {
                error!(
                    stream = %config.stream,
                    message_id = %message.id,
                    error = %err,
                    "failed to ack message"
                );
            }
        }
        Disposition::DeadLetter {
            error_type,
            message: error_message,
        } => {
            let now = Utc::now();
            if let Err(err) = bus
                .dead_letter(
                    &config.stream,
                    &message.id,
                    message.as_value(),
                    &error_message,
                    &error_type,
                    1,
                    now,
                )
                .await
            {
                error!(
                    stream = %config.stream,
                    message_id = %message.id,
                    error = %err,
                    "failed to dead-letter message"
                );
                // Leave unacked so it is redelivered rather than lost
                return;
            }
            if let Err(err) = bus.ack(&config.stream, &config.group, &message.id).await {
                error!(
                    stream = %config.stream,
                    message_id = %message.id,
                    error = %err,
                    "failed to ack dead-lettered message"
                );
            }
        }
        Disposition::Retry => {
            warn!(
                stream = %config.stream,
                message_id = %message.id,
                "message left pending for redelivery"
            );
        }
    }
}

/// Run the consumer loop until the shutdown signal flips to true.
///
/// In-flight work finishes the current message before the loop exits.
pub async fn run_consumer<H: EnvelopeHandler>(
    bus: EventBus,
    config: ConsumerConfig,
    handler: H,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), crate::bus::BusError> {
    bus.ensure_group(&config.stream, &config.group).await?;

    info!(
        stream = %config.stream,
        group = %config.group,
        consumer = %config.consumer_name,
        "consumer starting"
    );

    // Drain our own pending entries left over from a previous run. A
    // message that keeps coming back (handler said Retry) stops the drain
    // so startup cannot spin on it; the claim path picks it up later.
    let mut drained: std::collections::HashSet<String> = std::collections::HashSet::new();
    loop {
        let pending = bus
            .read_group(
                &config.stream,
                &config.group,
                &config.consumer_name,
                config.count,
                0,
                false,
            )
            .await?;
        if pending.is_empty() || pending.iter().any(|m| drained.contains(&m.id)) {
            break;
        }
        info!(
            stream = %config.stream,
            count = pending.len(),
            "re-processing pending entries from previous run"
        );
        for message in &pending {
            drained.insert(message.id.clone());
            dispatch(&bus, &config, &handler, message).await;
        }
    }

    loop {
        if *shutdown.borrow() {
            break;
        }

        let messages = match bus
            .read_group(
                &config.stream,
                &config.group,
                &config.consumer_name,
                config.count,
                config.block_ms,
                true,
            )
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                error!(stream = %config.stream, error = %err, "stream read failed");
                tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                continue;
            }
        };

        for message in &messages {
            dispatch(&bus, &config, &handler, message).await;
            if *shutdown.borrow() {
                break;
            }
        }

        // Periodically steal entries abandoned past the visibility timeout
        if messages.is_empty() {
            match bus
                .claim_stale(
                    &config.stream,
                    &config.group,
                    &config.consumer_name,
                    config.claim_idle_ms,
                    config.count,
                )
                .await
            {
                Ok(claimed) if !claimed.is_empty() => {
                    info!(
                        stream = %config.stream,
                        count = claimed.len(),
                        "claimed stale pending entries"
                    );
                    for message in &claimed {
                        dispatch(&bus, &config, &handler, message).await;
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(stream = %config.stream, error = %err, "stale claim failed");
                }
            }
        }
    }

    info!(stream = %config.stream, consumer = %config.consumer_name, "consumer stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_stream_read_contract() {
        let config = ConsumerConfig::new("grants:discovered", "curation_validators", "worker-1");
        assert_eq!(config.count, 10);
        assert_eq!(config.block_ms, 5_000);
        assert_eq!(config.claim_idle_ms, 300_000);
    }

    #[test]
    fn count_override() {
        let config =
            ConsumerConfig::new("grants:validated", "matching_engine", "w").with_count(1);
        assert_eq!(config.count, 1);
    }
}
