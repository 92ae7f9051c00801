//! Redis Streams transport: one consumer group per stream, XACK as the commit.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::AsyncCommands;
use redis::streams::{StreamId, StreamReadOptions, StreamReadReply};
use tracing::{debug, info, warn};

use super::log::{EventSink, EventSource, LogError, LogMessage};

const SOURCE: &str = "ingest::redis";
const FIELD_KEY: &str = "key";
const FIELD_PAYLOAD: &str = "payload";
/// Read the consumer's own pending entries.
const PENDING_ID: &str = "0";
/// Read entries never delivered to the group.
const NEW_ID: &str = ">";

async fn connection(pool: &Pool) -> Result<Connection, LogError> {
    pool.get().await.map_err(|err| {
        warn!(target = SOURCE, error = %err, "Failed to get Redis connection");
        LogError::unavailable(err)
    })
}

/// Appends entries with XADD. Cheap to clone.
#[derive(Clone)]
pub struct RedisStreamSink {
    pool: Pool,
}

impl RedisStreamSink {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSink for RedisStreamSink {
    async fn publish(&self, stream: &str, key: &str, payload: &str) -> Result<String, LogError> {
        let mut conn = connection(&self.pool).await?;
        conn.xadd(stream, "*", &[(FIELD_KEY, key), (FIELD_PAYLOAD, payload)])
            .await
            .map_err(LogError::unavailable)
    }
}

/// A consumer in a Redis Streams consumer group.
///
/// Starts by replaying its own pending list, so entries left uncommitted by a crash are
/// redelivered on restart.
pub struct RedisStreamLog {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
    block: Duration,
    group_ready: AtomicBool,
    replaying: AtomicBool,
    closed: AtomicBool,
}

impl RedisStreamLog {
    pub fn new(
        pool: Pool,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
        block: Duration,
    ) -> Self {
        Self {
            pool,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
            block,
            group_ready: AtomicBool::new(false),
            replaying: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    async fn ensure_group(&self, conn: &mut Connection) -> Result<(), LogError> {
        if self.group_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        let created: Result<(), redis::RedisError> = conn
            .xgroup_create_mkstream(&self.stream, &self.group, "0")
            .await;
        match created {
            Ok(()) => {
                info!(
                    target = SOURCE,
                    stream = %self.stream,
                    group = %self.group,
                    "Created consumer group"
                );
            }
            Err(err) if err.code() == Some("BUSYGROUP") => {}
            Err(err) => return Err(LogError::unavailable(err)),
        }
        self.group_ready.store(true, Ordering::Release);
        Ok(())
    }

    async fn read(
        &self,
        conn: &mut Connection,
        id: &str,
        max: usize,
    ) -> Result<Vec<StreamId>, LogError> {
        let mut options = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(max);
        if id == NEW_ID {
            options = options.block(self.block.as_millis().try_into().unwrap_or(usize::MAX));
        }
        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[id], &options)
            .await
            .map_err(|err| {
                if err.code() == Some("NOGROUP") {
                    self.group_ready.store(false, Ordering::Release);
                }
                LogError::unavailable(err)
            })?;
        Ok(reply
            .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
            .unwrap_or_default())
    }

    fn to_message(&self, entry: StreamId, redelivered: bool) -> LogMessage {
        LogMessage {
            key: entry.get(FIELD_KEY).unwrap_or_default(),
            payload: entry.get(FIELD_PAYLOAD).unwrap_or_default(),
            id: entry.id,
            stream: self.stream.clone(),
            redelivered,
        }
    }
}

#[async_trait]
impl EventSource for RedisStreamLog {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn fetch(&self, max: usize) -> Result<Vec<LogMessage>, LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        let max = max.max(1);
        let mut conn = connection(&self.pool).await?;
        self.ensure_group(&mut conn).await?;

        if self.replaying.load(Ordering::Acquire) {
            let pending = self.read(&mut conn, PENDING_ID, max).await?;
            if !pending.is_empty() {
                debug!(
                    target = SOURCE,
                    stream = %self.stream,
                    count = pending.len(),
                    "Replaying pending entries"
                );
                return Ok(pending
                    .into_iter()
                    .map(|entry| self.to_message(entry, true))
                    .collect());
            }
            self.replaying.store(false, Ordering::Release);
        }

        let fresh = self.read(&mut conn, NEW_ID, max).await?;
        Ok(fresh
            .into_iter()
            .map(|entry| self.to_message(entry, false))
            .collect())
    }

    async fn commit(&self, message: &LogMessage) -> Result<(), LogError> {
        let mut conn = connection(&self.pool).await?;
        let acked: i64 = conn
            .xack(&self.stream, &self.group, &[&message.id])
            .await
            .map_err(LogError::unavailable)?;
        if acked == 0 {
            debug!(
                target = SOURCE,
                stream = %self.stream,
                id = %message.id,
                "Entry was already acknowledged"
            );
        }
        Ok(())
    }

    async fn rewind(&self) -> Result<(), LogError> {
        self.replaying.store(true, Ordering::Release);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
