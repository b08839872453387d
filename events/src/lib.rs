//! Event plumbing for the GrantRadar pipeline
//!
//! Durable streams with consumer groups carry small JSON envelopes between
//! the agents; the authoritative records live in the entity store. This
//! crate owns the envelope types, the bus, the shared consumer loop, the
//! ephemeral keyspace helpers, and the one-way pipeline/heartbeat reporting
//! that the orchestrator observes.

pub mod bus;
pub mod consumer;
pub mod envelope;
pub mod kv;
pub mod metrics;
pub mod pipeline;

pub use bus::{BusError, EventBus, StreamMessage};
pub use consumer::{run_consumer, ConsumerConfig, Disposition, EnvelopeHandler};
pub use envelope::{
    dlq_stream, DeadLetterEvent, DiscoveredGrant, GrantValidatedEvent, MatchComputedEvent,
    PriorityLevel, ValidationDetails, ALERTER_GROUP, ALERTS_SENT_STREAM, CURATION_GROUP,
    DISCOVERED_STREAM, MATCHES_STREAM, MATCHING_GROUP, VALIDATED_STREAM,
};
pub use kv::KvStore;
pub use metrics::MetricsWriter;
pub use pipeline::{PipelineReporter, PipelineStage, PipelineState};
