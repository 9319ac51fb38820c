#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc)]

//! Producer entry point: IMAP polling into the primary stream

use clap::Parser;
use mailstream::auth::google::GoogleAuth;
use mailstream::auth::microsoft::MicrosoftAuth;
use mailstream::auth::AuthProvider;
use mailstream::health::HealthServer;
use mailstream::metrics::{self, Metrics};
use mailstream::store::memory::{MemoryLogStore, MemoryStateStore};
use mailstream::store::redis::{RedisLogStore, RedisStateStore};
use mailstream::store::{LogStore, StateStore};
use mailstream::{
    BreakerRegistry, BreakerState, Error, Producer, ProducerConfig, Provider, Result,
    ShutdownCoordinator,
};
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailstream-producer")]
#[command(about = "Polls an IMAP mailbox and appends records to the ingestion stream")]
struct Args {
    /// Account to poll (overrides IMAP_USERNAME)
    #[arg(long)]
    username: Option<String>,

    /// Folder to poll (overrides IMAP_MAILBOX)
    #[arg(long)]
    mailbox: Option<String>,

    /// Maximum UIDs fetched per cycle (overrides PRODUCER_BATCH_SIZE)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Seconds between cycles (overrides POLL_INTERVAL_SECS)
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Fetch and log records without appending or advancing the cursor
    #[arg(long)]
    dry_run: bool,

    /// Run the interactive OAuth2 flow, persist tokens, and exit
    #[arg(long)]
    auth_setup: bool,

    /// OAuth2 provider (overrides AUTH_PROVIDER)
    #[arg(long, value_parser = parse_provider)]
    provider: Option<Provider>,
}

fn parse_provider(s: &str) -> std::result::Result<Provider, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

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
    let mut config = ProducerConfig::from_env()?;
    if let Some(username) = args.username {
        config.imap.username = username;
    }
    if let Some(mailbox) = args.mailbox {
        config.imap.mailbox = mailbox;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(secs) = args.poll_interval {
        config.poll_interval = std::time::Duration::from_secs(secs);
    }
    if let Some(provider) = args.provider {
        config.auth.provider = provider;
    }
    config.dry_run = args.dry_run;

    let auth = make_auth(&config)?;

    if args.auth_setup {
        auth.interactive_setup().await?;
        let token_info = auth.info().await?;
        info!(
            expires_at = %token_info.expires_at,
            has_refresh_token = token_info.has_refresh_token,
            scopes = ?token_info.scopes,
            "authentication configured; tokens persisted"
        );
        return Ok(());
    }

    // Dry runs use in-process stores so a cycle can run without
    // infrastructure.
    let (log, state): (Arc<dyn LogStore>, Arc<dyn StateStore>) = if config.dry_run {
        info!("dry run: using in-process stores");
        (
            Arc::new(MemoryLogStore::new()),
            Arc::new(MemoryStateStore::new()),
        )
    } else {
        (
            Arc::new(RedisLogStore::connect(&config.streams.redis_url).await?),
            Arc::new(RedisStateStore::connect(&config.streams.redis_url).await?),
        )
    };

    let breakers = Arc::new(BreakerRegistry::new());
    let imap_breaker = breakers.register("imap", config.breaker);
    let store_breaker = breakers.register("redis", config.breaker);

    let metrics = Arc::new(Metrics::new()?);
    let shutdown = ShutdownCoordinator::new(config.shutdown_timeout);
    shutdown.listen_for_signals();

    let producer = Producer::new(
        config.clone(),
        auth,
        Arc::clone(&log),
        state,
        Arc::clone(&imap_breaker),
        Arc::clone(&store_breaker),
        Arc::clone(&metrics),
        Arc::clone(&shutdown),
    );
    let stats = producer.stats();

    // Supervision plane: health, metrics endpoint, depth poller.
    {
        let health = HealthServer::new(Arc::clone(&breakers))
            .check("imap", {
                let breaker = Arc::clone(&imap_breaker);
                move || breaker.state() != BreakerState::Open
            })
            .check("redis", {
                let breaker = Arc::clone(&store_breaker);
                move || breaker.state() != BreakerState::Open
            })
            .check("auth", {
                let stats = Arc::clone(&stats);
                move || stats.auth_healthy.load(Ordering::Relaxed)
            })
            .stats("producer", {
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

    // Teardown order: stop polling before the store clients go away.
    let (loop_done_tx, loop_done_rx) = tokio::sync::watch::channel(false);
    shutdown.register(10, "imap-poll", move || async move {
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
        account = %config.imap.username,
        mailbox = %config.imap.mailbox,
        dry_run = config.dry_run,
        "producer starting"
    );

    let outcome = producer.run().await;
    let _ = loop_done_tx.send(true);

    match outcome {
        Ok(()) => {
            // Signal-initiated: let the coordinator finish its sequence.
            shutdown.initiate().await;
            shutdown.wait_stopped().await;
            info!("producer stopped cleanly");
            Ok(())
        }
        Err(e) => {
            shutdown.initiate().await;
            shutdown.wait_stopped().await;
            Err(e)
        }
    }
}

fn make_auth(config: &ProducerConfig) -> Result<Arc<dyn AuthProvider>> {
    Ok(match config.auth.provider {
        Provider::Gmail => Arc::new(GoogleAuth::new(&config.auth)?),
        Provider::Outlook => Arc::new(MicrosoftAuth::new(&config.auth)?),
    })
}
