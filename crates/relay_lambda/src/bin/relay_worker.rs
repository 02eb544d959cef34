use std::sync::Arc;

use clap::Parser;
use relay_core::config::RelayConfig;
use relay_core::queue::MessageQueue;
use relay_core::worker::{spawn_pool, BatchReport, DeduplicatingHandler, MessageHandler};
use relay_lambda::adapters::aws::AwsClients;
use relay_lambda::handlers::consumer::LogEventHandler;
use relay_lambda::telemetry::init_tracing;
use tokio::sync::watch;

#[derive(Parser)]
#[command(
    name = "relay_worker",
    about = "Long-running consumer pool for the configured relay queue"
)]
struct Cli {
    /// Number of concurrent consumers polling the queue
    #[arg(long, env = "RELAY_WORKERS", default_value_t = 1)]
    workers: usize,
    /// Event ids remembered for duplicate suppression
    #[arg(long, default_value_t = 4_096)]
    dedup_capacity: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let cli = Cli::parse();

    let config = RelayConfig::from_env()?;
    let clients = AwsClients::from_env().await;
    let queue: Arc<dyn MessageQueue> = Arc::new(clients.primary_queue(&config)?);
    let handler: Arc<dyn MessageHandler> = Arc::new(DeduplicatingHandler::new(
        LogEventHandler,
        cli.dedup_capacity,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = spawn_pool(
        queue,
        handler,
        config.worker.clone(),
        cli.workers.max(1),
        shutdown_rx,
    )?;
    tracing::info!(workers = handles.len(), queue = %config.queue.name, "relay worker running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested; finishing in-flight batches");
    shutdown_tx.send_replace(true);

    let mut totals = BatchReport::default();
    for handle in handles {
        totals.absorb(handle.await?);
    }
    tracing::info!(
        received = totals.received,
        acknowledged = totals.acknowledged,
        failed = totals.failed,
        "relay worker stopped"
    );
    Ok(())
}
