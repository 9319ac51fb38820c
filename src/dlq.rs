//! Dead-letter routing and operator tooling
//!
//! Records that exhausted their retries or violated an invariant are
//! wrapped in a [`DlqEnvelope`] and appended to the DLQ stream.
//! `peek`, `reprocess`, and `clear` exist for operators working the
//! queue down.

use crate::error::{Error, Result};
use crate::record::DlqEnvelope;
use crate::store::{EntryId, LogStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

/// Router appending failure envelopes to the DLQ stream.
#[derive(Clone)]
pub struct DlqRouter {
    log: Arc<dyn LogStore>,
    stream: String,
}

impl DlqRouter {
    #[must_use]
    pub fn new(log: Arc<dyn LogStore>, stream: impl Into<String>) -> Self {
        Self {
            log,
            stream: stream.into(),
        }
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Wrap a failed record and append it to the DLQ.
    pub async fn send(
        &self,
        original_entry_id: &EntryId,
        payload: &str,
        error: &Error,
        retry_count: u32,
    ) -> Result<EntryId> {
        let envelope = DlqEnvelope {
            original_entry_id: original_entry_id.to_string(),
            payload: payload.to_string(),
            error_kind: error.kind().to_string(),
            error_message: error.to_string(),
            retry_count,
            failed_at: Utc::now(),
        };

        let id = self
            .log
            .append(&self.stream, &envelope.to_fields(), None)
            .await?;
        warn!(
            original = %original_entry_id,
            dlq_entry = %id,
            error_kind = envelope.error_kind,
            retry_count,
            "record routed to DLQ"
        );
        Ok(id)
    }

    /// The oldest `count` envelopes.
    pub async fn peek(&self, count: usize) -> Result<Vec<(EntryId, DlqEnvelope)>> {
        let entries = self.log.range(&self.stream, count).await?;
        entries
            .into_iter()
            .map(|entry| {
                let envelope = DlqEnvelope::from_fields(&entry.fields)?;
                Ok((entry.id, envelope))
            })
            .collect()
    }

    /// Re-append a DLQ'd record's original payload to `target_stream`
    /// and delete the DLQ entry.
    pub async fn reprocess(&self, dlq_entry_id: &EntryId, target_stream: &str) -> Result<EntryId> {
        let entry = self
            .log
            .get(&self.stream, dlq_entry_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no DLQ entry {dlq_entry_id}")))?;
        let envelope = DlqEnvelope::from_fields(&entry.fields)?;

        let new_id = self
            .log
            .append(target_stream, &[("payload", envelope.payload)], None)
            .await?;
        self.log.delete(&self.stream, &[dlq_entry_id.clone()]).await?;

        info!(
            dlq_entry = %dlq_entry_id,
            new_entry = %new_id,
            target = target_stream,
            "DLQ entry requeued"
        );
        Ok(new_id)
    }

    /// Delete every envelope. Returns how many were removed.
    pub async fn clear(&self) -> Result<u64> {
        let mut removed = 0;
        loop {
            let batch = self.log.range(&self.stream, 1000).await?;
            if batch.is_empty() {
                return Ok(removed);
            }
            let ids: Vec<EntryId> = batch.into_iter().map(|e| e.id).collect();
            removed += self.log.delete(&self.stream, &ids).await?;
        }
    }
}
