//! Worker: consumer-group loop over the primary stream
//!
//! Each batch from `read_group` is dispatched entry by entry inside its
//! own correlation scope: dedup check, processor call under a latency
//! timer, then exactly one terminal move per entry -- ack on success or
//! duplicate, DLQ + ack on invariant violation or retry exhaustion, or
//! left unacked so the pending/claim machinery redelivers it later.
//! A periodic sweep reclaims orphans from dead consumers and feeds them
//! through the same path.

use crate::backoff::BackoffController;
use crate::breaker::CircuitBreaker;
use crate::config::WorkerConfig;
use crate::correlation;
use crate::dlq::DlqRouter;
use crate::error::{Error, Result};
use crate::idempotency::IdempotencyFilter;
use crate::metrics::Metrics;
use crate::processor::Processor;
use crate::recovery::OrphanRecovery;
use crate::shutdown::ShutdownCoordinator;
use crate::store::{LogEntry, LogStore, StateStore};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Operational counters exposed on `/status`.
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub duplicates: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub awaiting_retry: AtomicU64,
    pub idempotency_set_size: AtomicU64,
}

impl WorkerStats {
    #[must_use]
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "processed": self.processed.load(Ordering::Relaxed),
            "failed": self.failed.load(Ordering::Relaxed),
            "duplicates": self.duplicates.load(Ordering::Relaxed),
            "dead_lettered": self.dead_lettered.load(Ordering::Relaxed),
            "awaiting_retry": self.awaiting_retry.load(Ordering::Relaxed),
            "idempotency_set_size": self.idempotency_set_size.load(Ordering::Relaxed),
        })
    }
}

/// The worker role: dispatch loop plus supervision hooks.
pub struct Worker {
    config: WorkerConfig,
    log: Arc<dyn LogStore>,
    idempotency: IdempotencyFilter,
    processor: Processor,
    backoff: BackoffController,
    dlq: DlqRouter,
    recovery: OrphanRecovery,
    store_breaker: Arc<CircuitBreaker>,
    metrics: Arc<Metrics>,
    shutdown: Arc<ShutdownCoordinator>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    #[must_use]
    pub fn new(
        config: WorkerConfig,
        log: Arc<dyn LogStore>,
        state: Arc<dyn StateStore>,
        processor: Processor,
        store_breaker: Arc<CircuitBreaker>,
        metrics: Arc<Metrics>,
        shutdown: Arc<ShutdownCoordinator>,
    ) -> Self {
        let dlq = DlqRouter::new(Arc::clone(&log), config.streams.dlq_stream.clone());
        let recovery = OrphanRecovery::new(
            Arc::clone(&log),
            dlq.clone(),
            config.recovery,
            config.streams.stream.clone(),
            config.streams.group.clone(),
            config.consumer.clone(),
            Arc::clone(&metrics),
        );
        Self {
            idempotency: IdempotencyFilter::new(state, config.idempotency_ttl),
            backoff: BackoffController::new(config.retry),
            dlq,
            recovery,
            config,
            log,
            processor,
            store_breaker,
            metrics,
            shutdown,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Consume until shutdown.
    pub async fn run(&self) -> Result<()> {
        // Groups start at `0` so records produced before the first
        // worker came up are still consumed.
        self.store_breaker
            .call(self.log.ensure_group(
                &self.config.streams.stream,
                &self.config.streams.group,
                "0",
            ))
            .await?;
        self.metrics.active_workers.inc();
        info!(
            stream = %self.config.streams.stream,
            group = %self.config.streams.group,
            consumer = %self.config.consumer,
            "worker consuming"
        );

        // First sweep runs immediately: entries orphaned while we were
        // down should not wait a full interval.
        let mut next_sweep = Instant::now();

        while self.shutdown.is_running() {
            if Instant::now() >= next_sweep {
                self.run_sweep().await;
                next_sweep = Instant::now() + self.config.recovery.interval;
            }

            let batch = tokio::select! {
                () = self.shutdown.wait() => break,
                batch = self.store_breaker.call(self.log.read_group(
                    &self.config.streams.stream,
                    &self.config.streams.group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.block_timeout,
                )) => batch,
            };

            match batch {
                Ok(entries) => {
                    for entry in entries {
                        self.dispatch(entry).await;
                    }
                }
                Err(Error::CircuitOpen(name)) => {
                    debug!(breaker = %name, "store circuit open, pausing reads");
                    if !self.shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                }
                Err(e) => {
                    warn!("read_group failed: {e}");
                    if !self.shutdown.sleep(Duration::from_secs(1)).await {
                        break;
                    }
                }
            }
        }

        self.metrics.active_workers.dec();
        Ok(())
    }

    async fn run_sweep(&self) {
        match self.recovery.sweep().await {
            Ok(report) => {
                self.stats
                    .dead_lettered
                    .fetch_add(report.dead_lettered, Ordering::Relaxed);
                for entry in report.claimed {
                    self.dispatch(entry).await;
                }
            }
            Err(e) => warn!("orphan sweep failed: {e}"),
        }
        // Retry slots for entries that reached a terminal state keep no
        // value once the pending list has forgotten them.
        self.backoff.gc(self.config.recovery.min_idle * 10);
    }

    /// Process one entry inside its own correlation scope. Store-level
    /// failures leave the entry unacked for redelivery.
    pub async fn dispatch(&self, entry: LogEntry) {
        let entry_id = entry.id.clone();
        let outcome =
            correlation::scope(correlation::new_id(), self.handle_entry(entry)).await;
        if let Err(e) = outcome {
            warn!(entry = %entry_id, "entry left pending after store failure: {e}");
        }
    }

    async fn handle_entry(&self, entry: LogEntry) -> Result<()> {
        let entry_id = entry.id.clone();

        // Exponential spacing for redelivered entries: not due yet
        // means leave it pending for a later sweep.
        if !self.backoff.is_due(entry_id.as_str()) {
            self.stats.awaiting_retry.store(
                self.backoff.tracked() as u64,
                Ordering::Relaxed,
            );
            debug!(entry = %entry_id, "redelivery before its backoff delay, deferred");
            return Ok(());
        }

        let Some(payload) = entry.field("payload").map(str::to_string) else {
            let missing = Error::InvariantViolation("entry has no payload field".into());
            return self.dead_letter(&entry_id, "", &missing, 0).await;
        };

        let record = match Processor::decode(&payload) {
            Ok(record) => record,
            Err(e) => return self.dead_letter(&entry_id, &payload, &e, 0).await,
        };

        if self.idempotency.seen(&record).await? {
            self.metrics.idempotency_duplicates_total.inc();
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(entry = %entry_id, id = %record.natural_id(), "duplicate skipped");
            self.ack(&entry_id).await?;
            self.backoff.record_success(entry_id.as_str());
            return Ok(());
        }

        let timer = self.metrics.processing_latency_seconds.start_timer();
        let outcome = self.processor.process(&record).await;
        timer.observe_duration();

        match outcome {
            Ok(_outcome) => {
                self.idempotency.mark(&record).await?;
                self.ack(&entry_id).await?;
                self.metrics.emails_processed_total.inc();
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                self.backoff.record_success(entry_id.as_str());

                if let Ok(size) = self
                    .idempotency
                    .partition_size(&record.account, &record.mailbox, record.uidvalidity)
                    .await
                {
                    self.stats.idempotency_set_size.store(size, Ordering::Relaxed);
                }
                Ok(())
            }
            Err(e @ Error::InvariantViolation(_)) => {
                self.metrics.emails_failed_total.inc();
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                self.dead_letter(&entry_id, &payload, &e, self.backoff.retry_count(entry_id.as_str()))
                    .await
            }
            Err(e) => {
                self.metrics.emails_failed_total.inc();
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                let retry_count = self.backoff.record_failure(entry_id.as_str());

                if self.backoff.should_retry(entry_id.as_str()) {
                    self.metrics.backoff_retries_total.inc();
                    warn!(
                        entry = %entry_id,
                        retry_count,
                        delay = ?self.backoff.delay_for(retry_count),
                        "processing failed, leaving pending for redelivery: {e}"
                    );
                    Ok(())
                } else {
                    let routed = self
                        .dead_letter(&entry_id, &payload, &e, retry_count)
                        .await;
                    self.backoff.record_success(entry_id.as_str());
                    routed
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        entry_id: &crate::store::EntryId,
        payload: &str,
        error: &Error,
        retry_count: u32,
    ) -> Result<()> {
        self.dlq.send(entry_id, payload, error, retry_count).await?;
        self.metrics.dlq_messages_total.inc();
        self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.ack(entry_id).await?;
        Ok(())
    }

    async fn ack(&self, entry_id: &crate::store::EntryId) -> Result<()> {
        self.store_breaker
            .call(self.log.ack(
                &self.config.streams.stream,
                &self.config.streams.group,
                std::slice::from_ref(entry_id),
            ))
            .await?;
        Ok(())
    }
}
