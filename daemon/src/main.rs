//! GrantRadar worker daemon
//!
//! One binary hosting every role. `--role all` runs the three stream
//! consumers plus the orchestrator in a single process; dedicated roles
//! run one consumer each so deployments can scale them independently.
//! Discovery and digest roles run one cycle and exit, driven by an
//! external scheduler.

mod environment;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use environment::Environment;
use grantradar_config::Settings;
use grantradar_curation::CurationValidator;
use grantradar_delivery::{Alerter, DigestProcessor};
use grantradar_discovery::{
    DiscoveryAgent, GrantsGovSource, NihPageSource, NihReporterSource, NsfSource,
};
use grantradar_events::{
    run_consumer, ConsumerConfig, ALERTER_GROUP, CURATION_GROUP, DISCOVERED_STREAM,
    MATCHES_STREAM, MATCHING_GROUP, VALIDATED_STREAM,
};
use grantradar_matching::{GrantEmbedder, GrantMatcher, ProfileBuilder};
use grantradar_orchestrator::{
    HealthChecker, LogNotifier, MetricsCollector, Orchestrator, PipelineTracker,
    PriorityQueueManager,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    /// All stream consumers plus the orchestrator
    All,
    /// Curation validator consumer only
    Curation,
    /// Matching engine consumer only
    Matching,
    /// Alert delivery consumer only
    Delivery,
    /// Orchestrator monitoring loop only
    Orchestrator,
    /// One discovery cycle across all sources, then exit
    Discovery,
    /// Process pending digests for today, then exit
    Digest,
    /// Refresh stale profile embeddings and backfill grant embeddings
    Maintenance,
    /// Print the full system status report and exit
    Status,
}

#[derive(Debug, Parser)]
#[command(name = "grantradar", about = "GrantRadar pipeline worker")]
struct Cli {
    /// Which role this process runs
    #[arg(long, value_enum, default_value = "all")]
    role: Role,
}

fn consumer_name(role: &str) -> String {
    format!("{role}-{}", std::process::id())
}

fn spawn_curation(env: &Environment, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let validator = CurationValidator::new(
        env.bus.clone(),
        env.kv.clone(),
        env.store.clone(),
        env.llm.clone(),
        env.embeddings.clone(),
        env.reporter.clone(),
        env.metrics.clone(),
    );
    let config = ConsumerConfig::new(
        DISCOVERED_STREAM,
        CURATION_GROUP,
        &consumer_name("curation"),
    );
    let bus = env.bus.clone();

    tokio::spawn(async move {
        if let Err(err) = run_consumer(bus, config, validator, shutdown).await {
            error!(error = %err, "curation consumer exited with error");
        }
    })
}

fn spawn_matching(env: &Environment, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let matcher = GrantMatcher::new(
        env.bus.clone(),
        env.kv.clone(),
        env.store.clone(),
        env.llm.clone(),
        env.reporter.clone(),
        env.metrics.clone(),
    );
    // Matching reads one grant at a time; each grant fans out to many
    // profile evaluations already
    let config = ConsumerConfig::new(VALIDATED_STREAM, MATCHING_GROUP, &consumer_name("matching"))
        .with_count(1);
    let bus = env.bus.clone();

    tokio::spawn(async move {
        if let Err(err) = run_consumer(bus, config, matcher, shutdown).await {
            error!(error = %err, "matching consumer exited with error");
        }
    })
}

fn spawn_delivery(env: &Environment, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let alerter = Alerter::new(
        env.bus.clone(),
        env.kv.clone(),
        env.store.clone(),
        env.email.clone(),
        env.sms.clone(),
        env.slack.clone(),
        env.llm.clone(),
        env.reporter.clone(),
        env.metrics.clone(),
        env.settings.frontend_url.clone(),
    );
    let config = ConsumerConfig::new(MATCHES_STREAM, ALERTER_GROUP, &consumer_name("delivery"));
    let bus = env.bus.clone();

    tokio::spawn(async move {
        if let Err(err) = run_consumer(bus, config, alerter, shutdown).await {
            error!(error = %err, "delivery consumer exited with error");
        }
    })
}

fn build_orchestrator(env: &Environment) -> Orchestrator {
    let tracker = PipelineTracker::new(env.reporter.clone(), env.bus.clone(), env.metrics.clone());
    let queues = PriorityQueueManager::new(env.kv.clone());
    let health = HealthChecker::new(
        env.bus.clone(),
        env.kv.clone(),
        env.store.clone(),
        vec![
            ("nsf_api".to_string(), env.settings.sources.nsf_api_url.clone()),
            (
                "nih_api".to_string(),
                env.settings.sources.nih_reporter_url.clone(),
            ),
            (
                "grants_gov".to_string(),
                env.settings.sources.grants_gov_extract_url.clone(),
            ),
        ],
    );
    let collector = MetricsCollector::new(env.bus.connection());
    Orchestrator::new(
        tracker,
        queues,
        health,
        collector,
        env.source_gate.clone(),
        Arc::new(LogNotifier),
    )
}

fn spawn_orchestrator(env: &Environment, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut orchestrator = build_orchestrator(env);
    let llm = env.llm.clone();

    tokio::spawn(async move {
        if let Err(err) = orchestrator.run(llm, shutdown).await {
            error!(error = %err, "orchestrator exited with error");
        }
    })
}

async fn run_discovery(env: &Environment) -> Result<()> {
    let sources = &env.settings.sources;

    let nsf = DiscoveryAgent::new(
        NsfSource::new(&sources.nsf_api_url),
        env.bus.clone(),
        env.kv.clone(),
        env.source_gate.for_source("nsf"),
    );
    let nih = DiscoveryAgent::new(
        NihReporterSource::new(&sources.nih_reporter_url),
        env.bus.clone(),
        env.kv.clone(),
        env.source_gate.for_source("nih"),
    );
    let grants_gov = DiscoveryAgent::new(
        GrantsGovSource::new(&sources.grants_gov_extract_url),
        env.bus.clone(),
        env.kv.clone(),
        env.source_gate.for_source("grants_gov"),
    );
    let nih_page = DiscoveryAgent::new(
        NihPageSource::new(
            &sources.nih_funding_page_url,
            env.llm.clone(),
            env.kv.clone(),
            env.settings.llm.max_context_chars,
        ),
        env.bus.clone(),
        env.kv.clone(),
        env.source_gate.for_source("nih_funding_page"),
    );

    let mut total = 0usize;
    for result in [
        nsf.run().await,
        nih.run().await,
        grants_gov.run().await,
        nih_page.run().await,
    ] {
        match result {
            Ok(count) => total += count,
            Err(err) => error!(error = %err, "discovery source cycle failed"),
        }
    }

    info!(published = total, "discovery cycle finished");
    Ok(())
}

async fn run_maintenance(env: &Environment) -> Result<()> {
    let profiles = ProfileBuilder::new(env.store.clone(), env.embeddings.clone());
    let mut refreshed = 0usize;
    for user_id in env.store.all_profile_user_ids().await? {
        match profiles.refresh(user_id).await {
            Ok(true) => refreshed += 1,
            Ok(false) => {}
            Err(err) => error!(%user_id, error = %err, "profile refresh failed"),
        }
    }

    let embedder = GrantEmbedder::new(env.store.clone(), env.embeddings.clone());
    let backfilled = embedder.backfill(500).await?;

    info!(refreshed, backfilled, "maintenance run finished");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = Settings::from_env()?;
    let env = Environment::build(settings).await?;

    match cli.role {
        Role::Discovery => return run_discovery(&env).await,
        Role::Maintenance => return run_maintenance(&env).await,
        Role::Digest => {
            let processor = DigestProcessor::new(
                env.kv.clone(),
                env.store.clone(),
                env.email.clone(),
                env.llm.clone(),
                env.metrics.clone(),
            );
            let processed = processor.process_all_due(&DigestProcessor::today()).await?;
            info!(processed, "digest run finished");
            return Ok(());
        }
        Role::Status => {
            let mut orchestrator = build_orchestrator(&env);
            let status = orchestrator.system_status(&env.llm).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
            return Ok(());
        }
        _ => {}
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<JoinHandle<()>> = Vec::new();

    match cli.role {
        Role::All => {
            handles.push(spawn_curation(&env, shutdown_rx.clone()));
            handles.push(spawn_matching(&env, shutdown_rx.clone()));
            handles.push(spawn_delivery(&env, shutdown_rx.clone()));
            handles.push(spawn_orchestrator(&env, shutdown_rx.clone()));
        }
        Role::Curation => handles.push(spawn_curation(&env, shutdown_rx.clone())),
        Role::Matching => handles.push(spawn_matching(&env, shutdown_rx.clone())),
        Role::Delivery => handles.push(spawn_delivery(&env, shutdown_rx.clone())),
        Role::Orchestrator => handles.push(spawn_orchestrator(&env, shutdown_rx.clone())),
        Role::Discovery | Role::Digest | Role::Maintenance | Role::Status => {
            unreachable!("handled above")
        }
    }

    info!(role = ?cli.role, workers = handles.len(), "grantradar started");

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, finishing in-flight work");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }

    info!("grantradar stopped");
    Ok(())
}
