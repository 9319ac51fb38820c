#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Worker entry point: consumer-group processing of the ingestion stream

use clap::Parser;
use mailstream::health::HealthServer;
use mailstream::metrics::{self, Metrics};
use mailstream::store::redis::{RedisLogStore, RedisStateStore};
use mailstream::store::{LogStore, StateStore};
use mailstream::{
    BreakerRegistry, BreakerState, ClassifyingHandler, Processor, Result, ShutdownCoordinator,
    Worker, WorkerConfig,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailstream-worker")]
#[command(about = "Consumes the ingestion stream with idempotent processing and DLQ routing")]
struct Args {
    /// Stream to consume (overrides STREAM_NAME)
    #[arg(long)]
    stream: Option<String>,

    /// Consumer group (overrides CONSUMER_GROUP)
    #[arg(long)]
    group: Option<String>,

    /// Consumer name within the group (overrides CONSUMER_NAME)
    #[arg(long)]
    consumer: Option<String>,

    /// Entries per read (overrides WORKER_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Milliseconds to block waiting for entries (overrides BLOCK_TIMEOUT_MS)
    #[arg(long)]
    block_timeout: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = WorkerConfig::from_env()?;
    if let Some(stream) = args.stream {
        config.streams.stream = stream;
    }
    if let Some(group) = args.group {
        config.streams.group = group;
    }
    if let Some(consumer) = args.consumer {
        config.consumer = consumer;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(ms) = args.block_timeout {
        config.block_timeout = std::time::Duration::from_millis(ms);
    }

    let log: Arc<dyn LogStore> =
        Arc::new(RedisLogStore::connect(&config.streams.redis_url).await?);
    let state: Arc<dyn StateStore> =
        Arc::new(RedisStateStore::connect(&config.streams.redis_url).await?);

    let breakers = Arc::new(BreakerRegistry::new());
    let store_breaker = breakers.register("redis", config.breaker);

    let metrics = Arc::new(Metrics::new()?);
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    shutdown.listen_for_signals();

    let worker = Worker::new(
        config.clone(),
        Arc::clone(&log),
        state,
        Processor::new(Arc::new(ClassifyingHandler)),
        Arc::clone(&store_breaker),
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    );
    let stats = worker.stats();

    // Supervision plane: health, metrics endpoint, depth poller.
    {
        let health = HealthServer::new(Arc::clone(&breakers))
            .check("redis", {
                let breaker = Arc::clone(&store_breaker);
                move || breaker.state() != BreakerState::Open
            })
            .stats("worker", {
                let stats = Arc::clone(&stats);
                move || stats.snapshot()
            });
        let port = config.health_port;
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = health.serve(port, shutdown).await {
                error!("health server failed: {e}");
            }
        });
    }
    {
        let metrics = Arc::clone(&metrics);
        let port = config.metrics_port;
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if let Err(e) = metrics::serve(metrics, port, shutdown).await {
                error!("metrics server failed: {e}");
            }
        });
    }
    metrics::spawn_depth_updater(
        Arc::clone(&metrics),
        Arc::clone(&log),
        Arc::clone(&breakers),
        config.streams.stream.clone(),
        config.streams.dlq_stream.clone(),
        config.metrics_update_interval,
        Arc::clone(&shutdown),
    );

    // Teardown order: stop reading before the store clients go away.
    let (loop_done_tx, loop_done_rx) = tokio::sync::watch::channel(false);
    shutdown.register(10, "consume-loop", move || async move {
        let mut rx = loop_done_rx;
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    });
    shutdown.register(20, "store-clients", || async {
        info!("store clients released");
    });

    info!(
        stream = %config.streams.stream,
        group = %config.streams.group,
        consumer = %config.consumer,
        "worker starting"
    );

    let outcome = worker.run().await;
    let _ = loop_done_tx.send(true);

    match outcome {
        Ok(()) => {
            shutdown.initiate().await;
            shutdown.wait_stopped().await;
            info!("worker stopped cleanly");
            Ok(())
        }
        Err(e) => {
            shutdown.initiate().await;
            shutdown.wait_stopped().await;
            Err(e)
        }
    }
}
