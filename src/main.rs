use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use creneau::captcha::CaptchaSolver;
use creneau::config::Config;
use creneau::dedup::{DedupGate, MemoryDedupGate, RedisDedupGate};
use creneau::dispatch::Dispatcher;
use creneau::interest::MemoryPartyStore;
use creneau::models::{InterestedParty, Target, TargetClass};
use creneau::notify::{LogNotifier, OperatorAlert, WebhookAlert};
use creneau::proxy::ProxyPool;
use creneau::registry::TargetRegistry;
use creneau::scheduler::{CheckJob, JobBoard, Reconciler};
use creneau::session::{CsrfPageSource, SessionManager};
use creneau::worker::http::HttpProbeExecutor;
use creneau::worker::{Worker, WorkerPool};

#[derive(Parser)]
#[command(
    name = "creneau",
    version,
    about = "Appointment-slot monitor for rate-limited booking sites",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection pipeline
    Run {
        /// Target definitions (JSON array)
        #[arg(short, long, default_value = "targets.json")]
        targets: String,

        /// Interested-party definitions (JSON array)
        #[arg(short, long)]
        parties: Option<String>,
    },

    /// Run a single check against one target and print the outcome
    Check {
        /// Target id to check
        target_id: String,

        /// Target definitions (JSON array)
        #[arg(short, long, default_value = "targets.json")]
        targets: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = Config::from_env()?;
    creneau::metrics::init_metrics();

    match cli.command {
        Commands::Run { targets, parties } => {
            tracing::info!(targets = %targets, parties = ?parties, "Starting detection pipeline");
            run(config, &targets, parties.as_deref()).await?;
        }
        Commands::Check { target_id, targets } => {
            tracing::info!(target = %target_id, "Starting one-off check");
            check(config, &target_id, &targets).await?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("creneau=debug,info")
    } else {
        tracing_subscriber::EnvFilter::new("creneau=info,warn")
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &str) -> Result<Vec<T>> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {path}"))
}

/// Dedup gate with graceful degradation: Redis when reachable, in-process
/// otherwise
fn build_gate(config: &Config) -> Arc<dyn DedupGate> {
    match RedisDedupGate::try_new(&config.redis, &config.dedup) {
        Ok(gate) => {
            tracing::info!(url = %config.redis.url, "Dedup gate backed by Redis");
            Arc::new(gate)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Redis unavailable, using in-process dedup gate");
            Arc::new(MemoryDedupGate::new(&config.dedup))
        }
    }
}

struct Pipeline {
    registry: Arc<TargetRegistry>,
    parties: Arc<MemoryPartyStore>,
    worker: Arc<Worker>,
    dispatcher: Arc<Dispatcher>,
}

fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let registry = Arc::new(TargetRegistry::new(
        config.monitor.max_consecutive_errors,
        config.monitor.check_log_size,
    ));
    let parties = Arc::new(MemoryPartyStore::new());

    let sessions = Arc::new(SessionManager::new(
        Duration::from_secs(config.monitor.session_ttl_secs),
        Arc::new(CsrfPageSource::new(config.monitor.check_timeout())?),
    ));
    let proxies = Arc::new(ProxyPool::from_settings(&config.proxy));

    let solver = CaptchaSolver::from_config(&config.captcha).map(Arc::new);
    if solver.is_none() {
        tracing::warn!("No captcha solver configured, challenges will park targets");
    }
    let executor = Arc::new(HttpProbeExecutor::new(
        config.monitor.check_timeout(),
        1,
        solver,
    ));

    let operator: Arc<dyn OperatorAlert> = match WebhookAlert::from_env() {
        Some(webhook) => Arc::new(webhook),
        None => Arc::new(LogNotifier),
    };

    let dispatcher = Arc::new(Dispatcher::new(
        parties.clone(),
        build_gate(config),
        Arc::new(LogNotifier),
        Arc::new(LogNotifier),
    ));

    let worker = Arc::new(Worker::new(
        registry.clone(),
        parties.clone(),
        sessions,
        proxies,
        dispatcher.clone(),
        operator,
        executor,
        config.monitor.check_timeout(),
    ));

    Ok(Pipeline {
        registry,
        parties,
        worker,
        dispatcher,
    })
}

async fn run(config: Config, targets_path: &str, parties_path: Option<&str>) -> Result<()> {
    let pipeline = build_pipeline(&config)?;

    for target in load_json::<Target>(targets_path)? {
        pipeline.registry.upsert(target).await;
    }
    if let Some(path) = parties_path {
        for party in load_json::<InterestedParty>(path)? {
            pipeline.parties.add(party).await;
        }
    }
    tracing::info!(
        targets = pipeline.registry.len().await,
        parties = pipeline.parties.len().await,
        bootstrap = config.bootstrap.enabled,
        "Pipeline loaded"
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // One channel and one pool per class
    let mut senders = HashMap::new();
    let mut pool_tasks = Vec::new();
    for class in TargetClass::ALL {
        let (tx, rx) = tokio::sync::mpsc::channel::<CheckJob>(256);
        senders.insert(class, tx);

        let mut concurrency = config.monitor.concurrency_for(class);
        if config.bootstrap.enabled {
            concurrency = concurrency.min(config.bootstrap.max_workers);
        }
        let pool = WorkerPool::new(pipeline.worker.clone(), concurrency);
        let pool_shutdown = shutdown_rx.clone();
        pool_tasks.push(tokio::spawn(async move {
            pool.run(rx, pool_shutdown).await;
        }));
    }

    let board = Arc::new(JobBoard::new(senders));
    let reconciler = Reconciler::new(
        pipeline.registry.clone(),
        pipeline.parties.clone(),
        board.clone(),
        config.bootstrap.clone(),
        Duration::from_secs(config.monitor.reconcile_interval_secs),
    );
    reconciler.reconcile_once().await;
    let reconciler_shutdown = shutdown_rx.clone();
    let reconciler_task = tokio::spawn(async move {
        reconciler.run(reconciler_shutdown).await;
    });

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutdown signal received");
    shutdown_tx.send(true).ok();
    board.clear().await;

    reconciler_task.await.ok();
    futures::future::join_all(pool_tasks).await;

    let records = pipeline.dispatcher.recent_records(10).await;
    tracing::info!(recent_dispatches = records.len(), "Pipeline stopped");
    Ok(())
}

async fn check(config: Config, target_id: &str, targets_path: &str) -> Result<()> {
    let pipeline = build_pipeline(&config)?;

    let targets = load_json::<Target>(targets_path)?;
    let target = targets
        .iter()
        .find(|t| t.id == target_id)
        .with_context(|| format!("target {target_id} not found in {targets_path}"))?;
    let class = target.class;
    pipeline.registry.upsert(target.clone()).await;
    // One-off checks run regardless of stored interest
    pipeline
        .parties
        .add(InterestedParty::new("operator_check", target_id))
        .await;

    let outcome = pipeline
        .worker
        .process_job(&CheckJob {
            target_id: target_id.to_string(),
            sub_category: None,
            class,
        })
        .await;
    tracing::info!(outcome = ?outcome, "Check finished");

    for record in pipeline.registry.recent_checks(1).await {
        println!(
            "{} {} slots={} {}ms{}",
            record.target_id,
            record.status,
            record.slots_found,
            record.response_time_ms,
            record
                .error_message
                .map(|m| format!(" error={m}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}
