//! Function worker binary.
//!
//! Hosts the workflow state described by a function params file and runs it
//! for every message on the state's NATS topic.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use function_worker::{Worker, WorkerConfig};
use workflow_engine::{create_default_registry, EngineConfig};

#[derive(Parser)]
#[command(name = "function-worker")]
#[command(version, about = "Workflow function worker", long_about = None)]
struct Args {
    /// Function params file (overrides FUNCTION_PARAMS)
    #[arg(short, long)]
    params: Option<PathBuf>,

    /// Maximum concurrent invocations (overrides WORKER_MAX_CONCURRENT)
    #[arg(short = 'c', long)]
    max_concurrent: Option<usize>,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,function_worker=debug,workflow_engine=debug".into());

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = WorkerConfig::from_env()?;
    if let Some(params) = args.params {
        config.function_params = params;
    }
    if let Some(max_concurrent) = args.max_concurrent.filter(|n| *n > 0) {
        config.max_concurrent = max_concurrent;
    }

    init_tracing(config.log_json);
    tracing::info!("Starting function worker");

    let params = config.load_params()?;
    let engine = EngineConfig::from_env()?;
    tracing::info!(
        worker_id = %config.worker_id,
        state = %params.state_name,
        topic = %params.state_topic(),
        nats_url = %config.nats_url,
        "Worker configuration loaded"
    );

    let worker = Worker::connect(config, params, engine, create_default_registry()).await?;

    // Handle shutdown signals
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
        tracing::info!("Shutdown signal received");
    };

    tokio::select! {
        result = worker.run() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Worker error");
                return Err(e);
            }
        }
        _ = shutdown => {
            tracing::info!("Shutting down worker");
        }
    }

    tracing::info!("Worker stopped");
    Ok(())
}
