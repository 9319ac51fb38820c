//! Log and state store interfaces
//!
//! The pipeline talks to its durable log (append-only stream with
//! consumer groups) and its scalar state store through these traits.
//! [`redis`] implements both over Redis streams and keys; [`memory`]
//! implements the same contracts in-process for tests and `--dry-run`.

pub mod memory;
pub mod redis;

use crate::error::Result;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// Server-assigned, monotonically increasing entry identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub String);

impl EntryId {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// One log entry: an ID plus its field/value pairs.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: EntryId,
    pub fields: Vec<(String, String)>,
}

impl LogEntry {
    /// Look up a field value by name.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A delivered-but-unacknowledged entry as seen by group bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    pub idle: Duration,
    pub delivery_count: u64,
}

/// Append-only log with consumer-group dispatch.
///
/// The contract the pipeline leans on: an entry appended to a stream is
/// delivered to exactly one consumer of a group per read, stays in the
/// group's pending list until acked, and can be claimed by another
/// consumer once idle. Ack is idempotent.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append an entry. When `max_len` is given the stream is trimmed
    /// approximately in the same call, so producers never block on trim.
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<EntryId>;

    /// Create the consumer group if it does not exist, positioned at
    /// `start` (`"0"` = from the beginning, `"$"` = new entries only).
    /// An existing group keeps its position and is not an error.
    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<()>;

    /// Read up to `count` entries not yet delivered to any consumer of
    /// the group, blocking up to `block` when none are available.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>>;

    /// Acknowledge entries. Returns how many were newly acked.
    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64>;

    /// Pending entries idle for at least `min_idle`.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    /// Transfer ownership of pending entries idle for at least
    /// `min_idle` to `consumer`, returning the claimed entries.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<LogEntry>>;

    /// Approximately trim the stream to `max_len` entries.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64>;

    /// Number of entries currently in the stream.
    async fn len(&self, stream: &str) -> Result<u64>;

    /// Oldest `count` entries, for inspection.
    async fn range(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>>;

    /// Fetch a single entry by ID.
    async fn get(&self, stream: &str, id: &EntryId) -> Result<Option<LogEntry>>;

    /// Delete entries outright (DLQ reprocess/clear tooling).
    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64>;
}

/// Durable scalar and set state, single-key atomic.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str) -> Result<()>;
    /// Atomic multi-key write (one MSET round trip).
    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Add a member to a set; returns whether it was newly added.
    async fn sadd(&self, set: &str, member: &str) -> Result<bool>;
    async fn sismember(&self, set: &str, member: &str) -> Result<bool>;
    async fn scard(&self, set: &str) -> Result<u64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}
