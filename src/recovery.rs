//! Orphan recovery: reclaiming entries from dead consumers
//!
//! A consumer that read entries and died leaves them in the group's
//! pending list. The sweep claims anything idle past `min_idle` for
//! this consumer so it is re-dispatched; entries already redelivered
//! more than `max_delivery` times go straight to the DLQ instead, once.

use crate::config::RecoveryConfig;
use crate::dlq::DlqRouter;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::{LogEntry, LogStore};
use std::sync::Arc;
use tracing::{info, warn};

/// One sweep's outcome.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub claimed: Vec<LogEntry>,
    pub dead_lettered: u64,
}

/// Periodic pending-list sweeper for one consumer.
pub struct OrphanRecovery {
    log: Arc<dyn LogStore>,
    dlq: DlqRouter,
    config: RecoveryConfig,
    stream: String,
    group: String,
    consumer: String,
    metrics: Arc<Metrics>,
}

impl OrphanRecovery {
    #[must_use]
    pub fn new(
        log: Arc<dyn LogStore>,
        dlq: DlqRouter,
        config: RecoveryConfig,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            log,
            dlq,
            config,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            metrics,
        }
    }

    /// Scan the pending list and claim or dead-letter orphans.
    ///
    /// Claimed entries are returned for the caller to re-dispatch
    /// through its normal path.
    pub async fn sweep(&self) -> Result<SweepReport> {
        let pending = self
            .log
            .pending(
                &self.stream,
                &self.group,
                self.config.min_idle,
                self.config.max_claim,
            )
            .await?;

        let mut report = SweepReport::default();
        for orphan in pending {
            // Our own fresh deliveries also sit in the pending list;
            // idle filtering already excluded the live ones.
            let claimed = self
                .log
                .claim(
                    &self.stream,
                    &self.group,
                    &self.consumer,
                    self.config.min_idle,
                    &[orphan.id.clone()],
                )
                .await?;

            let Some(entry) = claimed.into_iter().next() else {
                // Someone else claimed it first, or it aged back under
                // the threshold; either way it is no longer ours.
                continue;
            };

            if orphan.delivery_count > self.config.max_delivery {
                let payload = entry.field("payload").unwrap_or_default().to_string();
                let delivery_count = orphan.delivery_count;
                self.dlq
                    .send(
                        &entry.id,
                        &payload,
                        &Error::ExcessiveRedelivery(delivery_count),
                        u32::try_from(delivery_count).unwrap_or(u32::MAX),
                    )
                    .await?;
                self.log.ack(&self.stream, &self.group, &[entry.id]).await?;
                self.metrics.dlq_messages_total.inc();
                report.dead_lettered += 1;
                warn!(
                    delivery_count,
                    "entry exceeded the delivery limit, dead-lettered"
                );
            } else {
                self.metrics.orphans_claimed_total.inc();
                report.claimed.push(entry);
            }
        }

        if !report.claimed.is_empty() || report.dead_lettered > 0 {
            info!(
                claimed = report.claimed.len(),
                dead_lettered = report.dead_lettered,
                "orphan sweep complete"
            );
        }
        Ok(report)
    }
}
