//! Prometheus metrics
//!
//! One [`Metrics`] value per process, created in `main` and passed to
//! every component. A background updater polls stream depths and
//! breaker states; an axum endpoint serves the text exposition format
//! on the role's metrics port.

use crate::breaker::BreakerRegistry;
use crate::error::{Error, Result};
use crate::shutdown::ShutdownCoordinator;
use crate::store::LogStore;
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Self::Config(format!("metrics registration failed: {e}"))
    }
}

/// Every counter, histogram, and gauge the pipeline emits.
pub struct Metrics {
    registry: Registry,
    started_at: Instant,

    pub emails_produced_total: IntCounter,
    pub emails_processed_total: IntCounter,
    pub emails_failed_total: IntCounter,
    pub dlq_messages_total: IntCounter,
    pub backoff_retries_total: IntCounter,
    pub idempotency_duplicates_total: IntCounter,
    pub orphans_claimed_total: IntCounter,
    pub imap_polls_total: IntCounter,
    pub processing_latency_seconds: Histogram,
    pub imap_poll_duration_seconds: Histogram,
    pub stream_depth: IntGauge,
    pub dlq_depth: IntGauge,
    pub circuit_breaker_state: IntGaugeVec,
    pub uptime_seconds: IntGauge,
    pub active_workers: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let emails_produced_total = IntCounter::new(
            "emails_produced_total",
            "Records appended to the primary stream",
        )?;
        let emails_processed_total =
            IntCounter::new("emails_processed_total", "Records acked after success")?;
        let emails_failed_total =
            IntCounter::new("emails_failed_total", "Handler failures before retry accounting")?;
        let dlq_messages_total =
            IntCounter::new("dlq_messages_total", "Records routed to the DLQ")?;
        let backoff_retries_total =
            IntCounter::new("backoff_retries_total", "Retry delays consumed")?;
        let idempotency_duplicates_total = IntCounter::new(
            "idempotency_duplicates_total",
            "Records skipped as already processed",
        )?;
        let orphans_claimed_total =
            IntCounter::new("orphans_claimed_total", "Pending entries reclaimed")?;
        let imap_polls_total = IntCounter::new("imap_polls_total", "IMAP poll cycles attempted")?;

        let processing_latency_seconds = Histogram::with_opts(HistogramOpts::new(
            "processing_latency_seconds",
            "Per-record processing wall clock",
        ))?;
        let imap_poll_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "imap_poll_duration_seconds",
            "Per-cycle IMAP poll wall clock",
        ))?;

        let stream_depth = IntGauge::new("stream_depth", "Primary stream length")?;
        let dlq_depth = IntGauge::new("dlq_depth", "DLQ stream length")?;
        let circuit_breaker_state = IntGaugeVec::new(
            Opts::new(
                "circuit_breaker_state",
                "Breaker state: 0=closed, 1=open, 2=half-open",
            ),
            &["breaker"],
        )?;
        let uptime_seconds = IntGauge::new("uptime_seconds", "Seconds since process start")?;
        let active_workers = IntGauge::new("active_workers", "Registered worker instances")?;

        registry.register(Box::new(emails_produced_total.clone()))?;
        registry.register(Box::new(emails_processed_total.clone()))?;
        registry.register(Box::new(emails_failed_total.clone()))?;
        registry.register(Box::new(dlq_messages_total.clone()))?;
        registry.register(Box::new(backoff_retries_total.clone()))?;
        registry.register(Box::new(idempotency_duplicates_total.clone()))?;
        registry.register(Box::new(orphans_claimed_total.clone()))?;
        registry.register(Box::new(imap_polls_total.clone()))?;
        registry.register(Box::new(processing_latency_seconds.clone()))?;
        registry.register(Box::new(imap_poll_duration_seconds.clone()))?;
        registry.register(Box::new(stream_depth.clone()))?;
        registry.register(Box::new(dlq_depth.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;
        registry.register(Box::new(active_workers.clone()))?;

        Ok(Self {
            registry,
            started_at: Instant::now(),
            emails_produced_total,
            emails_processed_total,
            emails_failed_total,
            dlq_messages_total,
            backoff_retries_total,
            idempotency_duplicates_total,
            orphans_claimed_total,
            imap_polls_total,
            processing_latency_seconds,
            imap_poll_duration_seconds,
            stream_depth,
            dlq_depth,
            circuit_breaker_state,
            uptime_seconds,
            active_workers,
        })
    }

    /// Render the registry in Prometheus text exposition format.
    pub fn export(&self) -> Result<String> {
        self.uptime_seconds
            .set(self.started_at.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(Into::into)
    }

    /// Refresh breaker-state gauges from the registry snapshot.
    pub fn observe_breakers(&self, breakers: &BreakerRegistry) {
        for (name, state) in breakers.snapshot() {
            self.circuit_breaker_state
                .with_label_values(&[&name])
                .set(state.as_gauge());
        }
    }
}

/// Background task polling stream depths and breaker states.
pub fn spawn_depth_updater(
    metrics: Arc<Metrics>,
    log: Arc<dyn LogStore>,
    breakers: Arc<BreakerRegistry>,
    stream: String,
    dlq_stream: String,
    interval: Duration,
    shutdown: Arc<ShutdownCoordinator>,
) {
    tokio::spawn(async move {
        while shutdown.is_running() {
            match log.len(&stream).await {
                Ok(depth) => metrics.stream_depth.set(depth as i64),
                Err(e) => debug!("stream depth poll failed: {e}"),
            }
            match log.len(&dlq_stream).await {
                Ok(depth) => metrics.dlq_depth.set(depth as i64),
                Err(e) => debug!("DLQ depth poll failed: {e}"),
            }
            metrics.observe_breakers(&breakers);
            metrics
                .uptime_seconds
                .set(metrics.started_at.elapsed().as_secs() as i64);

            if !shutdown.sleep(interval).await {
                break;
            }
        }
    });
}

async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> (axum::http::StatusCode, String) {
    match metrics.export() {
        Ok(body) => (axum::http::StatusCode::OK, body),
        Err(e) => (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            format!("metrics export failed: {e}"),
        ),
    }
}

/// Serve `GET /metrics` until shutdown.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    shutdown: Arc<ShutdownCoordinator>,
) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "metrics endpoint listening");

    let wait = async move { shutdown.wait().await };
    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(wait)
        .await
    {
        warn!("metrics server exited: {e}");
    }
    Ok(())
}
