//! Redis implementation of the log and state stores
//!
//! Streams map onto XADD/XREADGROUP/XACK/XPENDING/XCLAIM/XTRIM; scalar
//! state onto plain keys and sets. A single multiplexed connection is
//! shared and cloned per call (clones are cheap handles onto the same
//! socket).

use super::{EntryId, LogEntry, LogStore, PendingEntry, StateStore};
use crate::error::{Error, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamMaxlen, StreamPendingCountReply, StreamRangeReply,
    StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use std::time::Duration;

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout()
        {
            Self::Unavailable(e.to_string())
        } else {
            Self::Invalid(e.to_string())
        }
    }
}

fn entries_from_ids(ids: Vec<StreamId>) -> Vec<LogEntry> {
    ids.into_iter()
        .map(|stream_id| {
            let fields = stream_id
                .map
                .iter()
                .filter_map(|(key, value)| {
                    redis::from_redis_value::<String>(value)
                        .ok()
                        .map(|v| (key.clone(), v))
                })
                .collect();
            LogEntry {
                id: EntryId(stream_id.id),
                fields,
            }
        })
        .collect()
}

/// Redis streams as the shared append-only log.
#[derive(Clone)]
pub struct RedisLogStore {
    conn: MultiplexedConnection,
}

impl RedisLogStore {
    /// Connect to the given `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::Config(format!("invalid redis url: {e}")))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl LogStore for RedisLogStore {
    async fn append(
        &self,
        stream: &str,
        fields: &[(&str, String)],
        max_len: Option<usize>,
    ) -> Result<EntryId> {
        let mut conn = self.conn.clone();
        let id: String = match max_len {
            Some(n) => {
                conn.xadd_maxlen(stream, StreamMaxlen::Approx(n), "*", fields)
                    .await?
            }
            None => conn.xadd(stream, "*", fields).await?,
        };
        Ok(EntryId(id))
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let created: std::result::Result<String, redis::RedisError> =
            conn.xgroup_create_mkstream(stream, group, start).await;
        match created {
            Ok(_) => Ok(()),
            // The group already existing is the normal steady state.
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);
        if !block.is_zero() {
            options = options.block(usize::try_from(block.as_millis()).unwrap_or(usize::MAX));
        }

        let reply: StreamReadReply = conn.xread_options(&[stream], &[">"], &options).await?;
        let entries = reply
            .keys
            .into_iter()
            .flat_map(|key| entries_from_ids(key.ids))
            .collect();
        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let raw: Vec<&str> = ids.iter().map(EntryId::as_str).collect();
        let acked: u64 = conn.xack(stream, group, &raw).await?;
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamPendingCountReply =
            conn.xpending_count(stream, group, "-", "+", count).await?;

        let min_idle_ms = min_idle.as_millis() as usize;
        let entries = reply
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| PendingEntry {
                id: EntryId(p.id),
                consumer: p.consumer,
                idle: Duration::from_millis(p.last_delivered_ms as u64),
                delivery_count: p.times_delivered as u64,
            })
            .collect();
        Ok(entries)
    }

    async fn claim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<LogEntry>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let raw: Vec<&str> = ids.iter().map(EntryId::as_str).collect();
        let reply: StreamClaimReply = conn
            .xclaim(
                stream,
                group,
                consumer,
                usize::try_from(min_idle.as_millis()).unwrap_or(usize::MAX),
                &raw,
            )
            .await?;
        Ok(entries_from_ids(reply.ids))
    }

    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.xtrim(stream, StreamMaxlen::Approx(max_len)).await?;
        Ok(removed)
    }

    async fn len(&self, stream: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(stream).await?;
        Ok(len)
    }

    async fn range(&self, stream: &str, count: usize) -> Result<Vec<LogEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn.xrange_count(stream, "-", "+", count).await?;
        Ok(entries_from_ids(reply.ids))
    }

    async fn get(&self, stream: &str, id: &EntryId) -> Result<Option<LogEntry>> {
        let mut conn = self.conn.clone();
        let reply: StreamRangeReply = conn
            .xrange_count(stream, id.as_str(), id.as_str(), 1)
            .await?;
        Ok(entries_from_ids(reply.ids).into_iter().next())
    }

    async fn delete(&self, stream: &str, ids: &[EntryId]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let raw: Vec<&str> = ids.iter().map(EntryId::as_str).collect();
        let deleted: u64 = conn.xdel(stream, &raw).await?;
        Ok(deleted)
    }
}

/// Redis keys and sets as the durable state store.
#[derive(Clone)]
pub struct RedisStateStore {
    conn: MultiplexedConnection,
}

impl RedisStateStore {
    /// Connect to the given `redis://` URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let client =
            redis::Client::open(url).map_err(|e| Error::Config(format!("invalid redis url: {e}")))?;
        let conn = client.get_multiplexed_async_connection().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl StateStore for RedisStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, String)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("MSET");
        for (key, value) in pairs {
            cmd.arg(*key).arg(value);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn sadd(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let added: u64 = conn.sadd(set, member).await?;
        Ok(added == 1)
    }

    async fn sismember(&self, set: &str, member: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let present: bool = conn.sismember(set, member).await?;
        Ok(present)
    }

    async fn scard(&self, set: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let cardinality: u64 = conn.scard(set).await?;
        Ok(cardinality)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, bool>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }
}
