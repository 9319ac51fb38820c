//! Idempotency filter over the processed-records set
//!
//! The set is partitioned by `(account, mailbox, uidvalidity)` so an
//! epoch reset can drop a whole partition with one key delete and
//! cardinality stays bounded per epoch. A record is marked only after
//! its processor succeeded; checks happen before processing.

use crate::error::Result;
use crate::record::MailRecord;
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Duration;

const BASE_KEY: &str = "idempotency:processed_ids";

/// The set key holding processed identities for one mailbox epoch.
#[must_use]
pub fn partition_key(account: &str, mailbox: &str, uidvalidity: u64) -> String {
    format!("{BASE_KEY}:{account}:{mailbox}:{uidvalidity}")
}

/// Dedup filter backed by the state store.
#[derive(Clone)]
pub struct IdempotencyFilter {
    state: Arc<dyn StateStore>,
    ttl: Option<Duration>,
}

impl IdempotencyFilter {
    #[must_use]
    pub fn new(state: Arc<dyn StateStore>, ttl: Option<Duration>) -> Self {
        Self { state, ttl }
    }

    fn key_for(record: &MailRecord) -> String {
        partition_key(&record.account, &record.mailbox, record.uidvalidity)
    }

    /// Has this record's natural identity already been processed?
    pub async fn seen(&self, record: &MailRecord) -> Result<bool> {
        self.state
            .sismember(&Self::key_for(record), &record.natural_id())
            .await
    }

    /// Mark the record processed. Returns whether the identity was new.
    pub async fn mark(&self, record: &MailRecord) -> Result<bool> {
        let key = Self::key_for(record);
        let added = self.state.sadd(&key, &record.natural_id()).await?;
        if let Some(ttl) = self.ttl {
            self.state.expire(&key, ttl).await?;
        }
        Ok(added)
    }

    /// Cardinality of one partition, for operational snapshots.
    pub async fn partition_size(
        &self,
        account: &str,
        mailbox: &str,
        uidvalidity: u64,
    ) -> Result<u64> {
        self.state
            .scard(&partition_key(account, mailbox, uidvalidity))
            .await
    }
}
