//! In-process store implementations
//!
//! Same contracts as the Redis implementations, backed by process
//! memory: entry IDs are `{seq}-0` with a monotonic sequence, each
//! consumer group keeps a dispatch cursor plus a pending list with idle
//! clocks and delivery counts. Used by the test suite and wired by the
//! producer's `--dry-run` mode so a cycle can run without
//! infrastructure.

use super::{EntryId, LogEntry, LogStore, PendingEntry, StateStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;

#[derive(Debug, Clone)]
struct StoredEntry {
    seq: u64,
    fields: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct Group {
    /// Sequence of the last entry dispatched to any consumer.
    cursor: u64,
    pending: HashMap<u64, PendingState>,
}

#[derive(Debug, Default)]
struct Stream {
    entries: Vec<StoredEntry>,
    groups: HashMap<String, Group>,
}

#[derive(Default)]
struct LogInner {
    streams: HashMap<String, Stream>,
    next_seq: u64,
}

/// In-memory append-only log with consumer-group dispatch.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    inner: Arc<Mutex<LogInner>>,
    appended: Arc<Notify>,
}

impl MemoryLogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Artificially age a pending entry (test clock control).
    pub fn age_pending(&self, stream: &str, group: &str, id: &EntryId, by: Duration) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(seq) = parse_seq(id)
            && let Some(stream) = inner.streams.get_mut(stream)
            && let Some(group) = stream.groups.get_mut(group)
            && let Some(pending) = group.pending.get_mut(&seq)
        {
            pending.delivered_at = pending
                .delivered_at
                .checked_sub(by)
                .unwrap_or(pending.delivered_at);
        }
    }
}

fn parse_seq(id: &EntryId) -> Option<u64> {
    id.as_str().split('-').next()?.parse().ok()
}

fn to_log_entry(entry: &StoredEntry) -> LogEntry {
    LogEntry {
        id: EntryId(format!("{}-0", entry.seq)),
        fields: entry.fields.clone(),
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<EntryId> {
        let id = {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            inner.next_seq += 1;
            let seq = inner.next_seq;
            let stream = inner.streams.entry(stream.to_string()).or_default();
            stream.entries.push(StoredEntry {
                seq,
                fields: fields
                    .iter()
                    .map(|(k, v)| ((*k).to_string(), v.clone()))
                    .collect(),
            });
            if let Some(max_len) = max_len
                && stream.entries.len() > max_len
            {
                let excess = stream.entries.len() - max_len;
                stream.entries.drain(..excess);
            }
            EntryId(format!("{seq}-0"))
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let tail = inner
            .streams
            .get(stream)
            .and_then(|s| s.entries.last())
            .map_or(0, |e| e.seq);
        // XGROUP CREATE semantics: `$` positions a new group at the
        // tail, `0` (or any id) at that point; an existing group keeps
        // its position.
        let cursor = match start {
            "$" => tail,
            "0" | "-" => 0,
            other => other.split('-').next().and_then(|s| s.parse().ok()).unwrap_or(0),
        };
        let stream = inner.streams.entry(stream.to_string()).or_default();
        stream
            .groups
            .entry(group.to_string())
            .or_insert_with(|| Group {
                cursor,
                pending: HashMap::new(),
            });
        Ok(())
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let deadline = Instant::now() + block;
        loop {
            {
                let mut inner = self
                    .inner
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let Some(stream_state) = inner.streams.get_mut(stream) else {
                    return Err(Error::NotFound(format!("no such stream '{stream}'")));
                };
                let Some(group_state) = stream_state.groups.get_mut(group) else {
                    return Err(Error::NotFound(format!(
                        "no group '{group}' on stream '{stream}'"
                    )));
                };

                let cursor = group_state.cursor;
                let fresh: Vec<&StoredEntry> = stream_state
                    .entries
                    .iter()
                    .filter(|e| e.seq > cursor)
                    .take(count)
                    .collect();

                if !fresh.is_empty() {
                    let now = Instant::now();
                    let mut delivered = Vec::with_capacity(fresh.len());
                    for entry in fresh {
                        group_state.cursor = entry.seq;
                        group_state.pending.insert(
                            entry.seq,
                            PendingState {
                                consumer: consumer.to_string(),
                                delivered_at: now,
                                delivery_count: 1,
                            },
                        );
                        delivered.push(to_log_entry(entry));
                    }
                    return Ok(delivered);
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // Wake on append or re-check every 10ms, whichever is first;
            // the notify can race registration, the poll bounds the miss.
            let wait = remaining.min(Duration::from_millis(10));
            let _ = tokio::time::timeout(wait, self.appended.notified()).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(group_state) = inner
            .streams
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
        else {
            return Ok(0);
        };
        let mut acked = 0;
        for id in ids {
            if let Some(seq) = parse_seq(id)
                && group_state.pending.remove(&seq).is_some()
            {
                acked += 1;
            }
        }
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(group_state) = inner.streams.get(stream).and_then(|s| s.groups.get(group)) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut pending: Vec<PendingEntry> = group_state
            .pending
            .iter()
            .filter_map(|(seq, state)| {
                let idle = now.saturating_duration_since(state.delivered_at);
                (idle >= min_idle).then(|| PendingEntry {
                    id: EntryId(format!("{seq}-0")),
                    consumer: state.consumer.clone(),
                    idle,
                    delivery_count: state.delivery_count,
                })
            })
            .collect();
        pending.sort_by_key(|p| parse_seq(&p.id));
        pending.truncate(count);
        Ok(pending)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<LogEntry>> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(stream_state) = inner.streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let entries_by_seq: HashMap<u64, StoredEntry> = stream_state
            .entries
            .iter()
            .map(|e| (e.seq, e.clone()))
            .collect();
        let Some(group_state) = stream_state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        for id in ids {
            let Some(seq) = parse_seq(id) else { continue };
            let Some(state) = group_state.pending.get_mut(&seq) else {
                continue;
            };
            if now.saturating_duration_since(state.delivered_at) < min_idle {
                continue;
            }
            state.consumer = consumer.to_string();
            state.delivered_at = now;
            state.delivery_count += 1;
            if let Some(entry) = entries_by_seq.get(&seq) {
                claimed.push(to_log_entry(entry));
            } else {
                // Entry was trimmed away; drop the dangling pending slot.
                group_state.pending.remove(&seq);
            }
        }
        Ok(claimed)
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(stream_state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        if stream_state.entries.len() <= max_len {
            return Ok(0);
        }
        let excess = stream_state.entries.len() - max_len;
        stream_state.entries.drain(..excess);
        Ok(excess as u64)
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(inner.streams.get(stream).map_or(0, |s| s.entries.len() as u64))
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(inner.streams.get(stream).map_or_else(Vec::new, |s| {
            s.entries.iter().take(count).map(to_log_entry).collect()
        }))
    }

    async fn get(&self, stream: &str, id: &EntryId) -> Result<Option<LogEntry>> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(seq) = parse_seq(id) else {
            return Ok(None);
        };
        Ok(inner
            .streams
            .get(stream)
            .and_then(|s| s.entries.iter().find(|e| e.seq == seq))
            .map(to_log_entry))
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(stream_state) = inner.streams.get_mut(stream) else {
            return Ok(0);
        };
        let seqs: HashSet<u64> = ids.iter().filter_map(parse_seq).collect();
        let before = stream_state.entries.len();
        stream_state.entries.retain(|e| !seqs.contains(&e.seq));
        Ok((before - stream_state.entries.len()) as u64)
    }
}

#[derive(Default)]
struct StateInner {
    values: HashMap<String, String>,
    sets: HashMap<String, HashSet<String>>,
}

/// In-memory scalar and set state.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<StateInner>>,
}

impl MemoryStateStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(inner.values.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for (key, value) in pairs {
            inner.values.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.values.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<bool> {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(inner
            .sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn sismember(&self, set: &str, member: &str) -> Result<bool> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(inner.sets.get(set).is_some_and(|s| s.contains(member)))
    }

    async fn scard(&self, set: &str) -> Result<u64> {
        let inner = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(inner.sets.get(set).map_or(0, |s| s.len() as u64))
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<()> {
        // TTLs are a durability concern of the real store; the
        // in-process store keeps everything for the process lifetime.
        Ok(())
    }
}
