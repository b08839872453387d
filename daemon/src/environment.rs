//! Process environment
//!
//! Everything a worker role needs, constructed once at startup and passed
//! through constructors: pooled bus and store connections, gateway
//! clients, circuit breakers, and the pipeline/metrics reporters. No
//! hidden module state.

use anyhow::{Context, Result};
use grantradar_config::Settings;
use grantradar_events::{EventBus, KvStore, MetricsWriter, PipelineReporter};
use grantradar_gateways::{
    EmailGateway, EmbeddingClient, LlmClient, SlackGateway, SmsGateway, SourceGate,
};
use grantradar_storage::EntityStore;
use std::sync::Arc;
use tracing::info;

/// Shared process environment
pub struct Environment {
    pub settings: Settings,
    pub bus: EventBus,
    pub kv: KvStore,
    pub store: EntityStore,
    pub llm: Arc<LlmClient>,
    pub embeddings: Arc<EmbeddingClient>,
    pub email: Arc<EmailGateway>,
    pub sms: Arc<SmsGateway>,
    pub slack: Arc<SlackGateway>,
    pub source_gate: Arc<SourceGate>,
    pub reporter: PipelineReporter,
    pub metrics: MetricsWriter,
}

impl Environment {
    /// Connect everything and run migrations
    pub async fn build(settings: Settings) -> Result<Self> {
        let bus = EventBus::connect(&settings.redis_url)
            .await
            .context("event bus connection failed")?;
        let kv = KvStore::new(bus.connection());
        let metrics = MetricsWriter::new(bus.connection());
        let reporter = PipelineReporter::new(kv.clone());

        let store = EntityStore::connect(&settings.database)
            .await
            .context("entity store connection failed")?;
        store.run_migrations().await?;

        let llm = Arc::new(LlmClient::new(&settings.llm));
        let embeddings = Arc::new(EmbeddingClient::new(&settings.embedding));
        let email = Arc::new(EmailGateway::new(&settings.channels.email));
        let sms = Arc::new(SmsGateway::new(&settings.channels.sms));
        let slack = Arc::new(SlackGateway::new(settings.channels.slack_webhook_url.clone()));
        let source_gate = Arc::new(SourceGate::new());

        info!("process environment ready");

        Ok(Self {
            settings,
            bus,
            kv,
            store,
            llm,
            embeddings,
            email,
            sms,
            slack,
            source_gate,
            reporter,
            metrics,
        })
    }
}
