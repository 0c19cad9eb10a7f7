use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use funnel_core::config::FunnelConfig;
use funnel_htl::memory::MemoryStage;
use funnel_htl::HtlPipeline;
use funnel_llm::ChatClient;
use funnel_retrieval::{EmbeddingClient, KnowledgeStore, RetrievalEngine};
use funnel_rpc::RpcClient;
use funnel_scheduler::SchedulerEngine;
use funnel_worker::apply::ActionApplier;
use funnel_worker::consumer::Consumer;
use funnel_worker::debounce::DebounceTable;
use funnel_worker::queue::{EventQueue, HttpQueue};
use funnel_worker::sink::{PipelineSink, FOLLOWUP_TRIGGER_TEXT};

#[derive(Parser)]
#[command(name = "funnel", about = "WhatsApp funnel automation worker")]
struct Cli {
    /// Path to funnel.toml (default: ~/.funnel/funnel.toml).
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the queue consumer and the follow-up scheduler.
    Start,
    /// Signal a running worker to shut down gracefully.
    Stop,
    /// Dangerous: truncate conversations, messages and leads via RPC.
    ResetState {
        /// Required confirmation.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "funnel_worker=info,funnel_htl=info,funnel_scheduler=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = FunnelConfig::load(cli.config.as_deref()).context("loading configuration")?;

    match cli.command {
        Command::Start => start(config).await,
        Command::Stop => stop(&config),
        Command::ResetState { yes } => reset_state(&config, yes).await,
    }
}

async fn start(config: FunnelConfig) -> anyhow::Result<()> {
    config.validate_for_worker()?;

    let rpc = Arc::new(RpcClient::new(
        config.rpc.base_url.clone(),
        config.rpc.internal_secret.clone().unwrap_or_default(),
    ));
    let chat = Arc::new(ChatClient::new(
        config.llm.base_url.clone(),
        config.llm.api_key.clone().unwrap_or_default(),
    ));

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let knowledge = Arc::new(KnowledgeStore::open(&config.database.path)?);
    let embedder = EmbeddingClient::new(
        config.embedding_base_url(),
        config.embedding_api_key().unwrap_or_default(),
        config.embedding.model.clone(),
    );
    let retrieval = Arc::new(RetrievalEngine::new(
        knowledge,
        embedder,
        config.pipeline.retrieval.clone(),
    ));

    let pipeline = HtlPipeline::new(Arc::clone(&chat), &config.llm, Some(retrieval));
    let memory = Arc::new(MemoryStage::new(Arc::clone(&chat), config.llm.model.clone()));
    let applier = ActionApplier::new(Arc::clone(&rpc), memory);
    let sink = Arc::new(PipelineSink::new(
        Arc::clone(&rpc),
        pipeline,
        applier,
        config.pipeline.budget_seconds,
        config.pipeline.history_messages,
    ));
    let debounce = DebounceTable::new(config.debounce.window_seconds, sink);

    let queue: Arc<dyn EventQueue> = Arc::new(HttpQueue::new(
        config.queue.url.clone().unwrap_or_default(),
        config.queue.visibility_timeout_seconds,
    ));
    let consumer = Consumer::new(
        queue,
        Arc::clone(&rpc),
        debounce.clone(),
        config.queue.batch_size,
        config.queue.wait_seconds,
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Scheduler → follow-up receiver → debounce.inject.
    let (followup_tx, mut followup_rx) = mpsc::channel(64);
    let scheduler = SchedulerEngine::new(
        Arc::clone(&rpc),
        config.scheduler.interval_seconds,
        followup_tx,
    );
    tokio::spawn(scheduler.run(shutdown_rx.clone()));

    let inject_table = debounce.clone();
    let mut inject_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                trigger = followup_rx.recv() => {
                    let Some(trigger) = trigger else { break };
                    if let Err(e) = inject_table
                        .inject(
                            trigger.conversation_id,
                            trigger.tenant_id,
                            FOLLOWUP_TRIGGER_TEXT.to_string(),
                        )
                        .await
                    {
                        warn!(
                            conversation_id = trigger.conversation_id,
                            error = %e,
                            "follow-up injection failed"
                        );
                    }
                }
                _ = inject_shutdown.changed() => {
                    if *inject_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    write_liveness(&config.scheduler.liveness_path)?;
    spawn_liveness_watcher(config.scheduler.liveness_path.clone(), shutdown_tx.clone());

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = signal_tx.send(true);
        }
    });

    info!("funnel worker started");
    consumer.run(shutdown_rx).await;

    let _ = std::fs::remove_file(&config.scheduler.liveness_path);
    info!("funnel worker stopped");
    Ok(())
}

fn stop(config: &FunnelConfig) -> anyhow::Result<()> {
    let path = &config.scheduler.liveness_path;
    if !std::path::Path::new(path).exists() {
        bail!("no running worker (liveness file {path} not found)");
    }
    std::fs::remove_file(path).with_context(|| format!("removing liveness file {path}"))?;
    println!("stop signal sent (liveness file removed)");
    Ok(())
}

async fn reset_state(config: &FunnelConfig, yes: bool) -> anyhow::Result<()> {
    if !yes {
        bail!("reset-state wipes all conversations, messages and leads; re-run with --yes");
    }
    let secret = config
        .rpc
        .internal_secret
        .clone()
        .ok_or_else(|| anyhow::anyhow!("INTERNAL_SECRET is not configured"))?;
    let rpc = RpcClient::new(config.rpc.base_url.clone(), secret);
    let stats = rpc.reset_state().await?;
    println!(
        "state reset: {} conversations, {} messages, {} leads deleted",
        stats.conversations_deleted, stats.messages_deleted, stats.leads_deleted
    );
    Ok(())
}

fn write_liveness(path: &str) -> anyhow::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", std::process::id()))
        .with_context(|| format!("writing liveness file {path}"))?;
    Ok(())
}

/// The `stop` subcommand removes the liveness file; noticing that here turns
/// it into a graceful shutdown.
fn spawn_liveness_watcher(path: String, shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            interval.tick().await;
            if !std::path::Path::new(&path).exists() {
                info!("liveness file removed, shutting down");
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    });
}
