//! In-process event log with consumer-group semantics.
//!
//! Each stream has a single consumer group: one delivery cursor and one pending set shared by
//! every source subscribed to it. Entry ids mimic Redis Streams (`<seq>-0`).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::util::lock::mutex_lock;

use super::log::{EventSink, EventSource, LogError, LogMessage};

const SOURCE: &str = "ingest::memory";

#[derive(Debug, Clone)]
struct Entry {
    key: String,
    payload: String,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<Entry>,
    cursor: usize,
    pending: BTreeSet<usize>,
    delivered_before: BTreeSet<usize>,
    replaying: bool,
}

impl StreamState {
    fn message(&self, stream: &str, seq: usize) -> LogMessage {
        let entry = &self.entries[seq];
        LogMessage {
            id: format!("{seq}-0"),
            stream: stream.to_string(),
            key: entry.key.clone(),
            payload: entry.payload.clone(),
            redelivered: self.delivered_before.contains(&seq),
        }
    }
}

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<String, StreamState>>,
    appended: Notify,
}

/// Shared handle to an in-process log. Clones see the same streams.
#[derive(Clone, Default)]
pub struct MemoryEventLog {
    shared: Arc<Shared>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A consumer for `stream` that waits up to `wait` for new entries on an empty fetch.
    pub fn subscribe(&self, stream: impl Into<String>, wait: Duration) -> MemoryStreamSource {
        MemoryStreamSource {
            shared: Arc::clone(&self.shared),
            stream: stream.into(),
            wait,
            closed: AtomicBool::new(false),
        }
    }

    /// Number of entries ever appended to `stream`.
    pub fn len(&self, stream: &str) -> usize {
        let streams = mutex_lock(&self.shared.streams, SOURCE, "len");
        streams.get(stream).map_or(0, |state| state.entries.len())
    }

    pub fn is_empty(&self, stream: &str) -> bool {
        self.len(stream) == 0
    }

    /// Number of delivered but uncommitted entries in `stream`.
    pub fn pending(&self, stream: &str) -> usize {
        let streams = mutex_lock(&self.shared.streams, SOURCE, "pending");
        streams.get(stream).map_or(0, |state| state.pending.len())
    }

    /// `(key, payload)` of every entry in `stream`, in append order.
    pub fn entries(&self, stream: &str) -> Vec<(String, String)> {
        let streams = mutex_lock(&self.shared.streams, SOURCE, "entries");
        streams
            .get(stream)
            .map(|state| {
                state
                    .entries
                    .iter()
                    .map(|entry| (entry.key.clone(), entry.payload.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for MemoryEventLog {
    async fn publish(&self, stream: &str, key: &str, payload: &str) -> Result<String, LogError> {
        let id = {
            let mut streams = mutex_lock(&self.shared.streams, SOURCE, "publish");
            let state = streams.entry(stream.to_string()).or_default();
            state.entries.push(Entry {
                key: key.to_string(),
                payload: payload.to_string(),
            });
            format!("{}-0", state.entries.len() - 1)
        };
        self.shared.appended.notify_waiters();
        Ok(id)
    }
}

pub struct MemoryStreamSource {
    shared: Arc<Shared>,
    stream: String,
    wait: Duration,
    closed: AtomicBool,
}

impl MemoryStreamSource {
    fn take_batch(&self, max: usize) -> Vec<LogMessage> {
        let mut streams = mutex_lock(&self.shared.streams, SOURCE, "fetch");
        let state = streams.entry(self.stream.clone()).or_default();

        if state.replaying {
            let batch: Vec<LogMessage> = state
                .pending
                .iter()
                .take(max)
                .map(|seq| state.message(&self.stream, *seq))
                .collect();
            if !batch.is_empty() {
                return batch;
            }
            state.replaying = false;
        }

        let end = state.entries.len().min(state.cursor + max);
        let fresh: Vec<usize> = (state.cursor..end).collect();
        state.cursor = end;
        fresh
            .into_iter()
            .map(|seq| {
                let message = state.message(&self.stream, seq);
                state.pending.insert(seq);
                state.delivered_before.insert(seq);
                message
            })
            .collect()
    }
}

fn parse_seq(id: &str) -> Option<usize> {
    id.split_once('-').and_then(|(seq, _)| seq.parse().ok())
}

#[async_trait]
impl EventSource for MemoryStreamSource {
    fn stream(&self) -> &str {
        &self.stream
    }

    async fn fetch(&self, max: usize) -> Result<Vec<LogMessage>, LogError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        let max = max.max(1);
        let appended = self.shared.appended.notified();
        let batch = self.take_batch(max);
        if !batch.is_empty() {
            return Ok(batch);
        }
        if tokio::time::timeout(self.wait, appended).await.is_err() {
            return Ok(Vec::new());
        }
        Ok(self.take_batch(max))
    }

    async fn commit(&self, message: &LogMessage) -> Result<(), LogError> {
        let Some(seq) = parse_seq(&message.id) else {
            debug!(
                target = SOURCE,
                stream = %self.stream,
                id = %message.id,
                "Ignoring commit for unknown id"
            );
            return Ok(());
        };
        let mut streams = mutex_lock(&self.shared.streams, SOURCE, "commit");
        if let Some(state) = streams.get_mut(&self.stream) {
            state.pending.remove(&seq);
        }
        Ok(())
    }

    async fn rewind(&self) -> Result<(), LogError> {
        let mut streams = mutex_lock(&self.shared.streams, SOURCE, "rewind");
        let state = streams.entry(self.stream.clone()).or_default();
        state.replaying = !state.pending.is_empty();
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn delivers_in_order_and_forgets_committed() {
        let log = MemoryEventLog::new();
        let source = log.subscribe("posts", WAIT);
        for payload in ["a", "b", "c"] {
            log.publish("posts", "k", payload).await.expect("publish");
        }

        let batch = source.fetch(2).await.expect("fetch");
        let payloads: Vec<_> = batch.iter().map(|m| m.payload.as_str()).collect();
        assert_eq!(payloads, vec!["a", "b"]);
        assert!(batch.iter().all(|m| !m.redelivered));

        for message in &batch {
            source.commit(message).await.expect("commit");
        }
        assert_eq!(log.pending("posts"), 0);

        let rest = source.fetch(10).await.expect("fetch");
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, "c");
        assert_eq!(rest[0].id, "2-0");
    }

    #[tokio::test]
    async fn rewind_redelivers_pending_before_new_entries() {
        let log = MemoryEventLog::new();
        let source = log.subscribe("votes", WAIT);
        log.publish("votes", "vote_post", "first").await.expect("publish");
        log.publish("votes", "vote_post", "second").await.expect("publish");

        let batch = source.fetch(10).await.expect("fetch");
        source.commit(&batch[0]).await.expect("commit");
        log.publish("votes", "vote_post", "third").await.expect("publish");
        source.rewind().await.expect("rewind");

        let replay = source.fetch(10).await.expect("replay");
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].payload, "second");
        assert!(replay[0].redelivered);
        source.commit(&replay[0]).await.expect("commit");

        let next = source.fetch(10).await.expect("fetch");
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].payload, "third");
        assert!(!next[0].redelivered);
    }

    #[tokio::test]
    async fn empty_fetch_waits_then_returns_nothing() {
        let log = MemoryEventLog::new();
        let source = log.subscribe("idle", WAIT);
        assert!(source.fetch(5).await.expect("fetch").is_empty());
    }

    #[tokio::test]
    async fn waiting_fetch_wakes_on_publish() {
        let log = MemoryEventLog::new();
        let source = log.subscribe("wake", Duration::from_secs(5));
        let publisher = log.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("wake", "k", "hello").await.expect("publish");
        });

        let batch = source.fetch(5).await.expect("fetch");
        handle.await.expect("publisher");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, "hello");
    }

    #[tokio::test]
    async fn closed_source_refuses_fetch() {
        let log = MemoryEventLog::new();
        let source = log.subscribe("s", WAIT);
        source.close().await;
        assert_eq!(source.fetch(1).await, Err(LogError::Closed));
    }
}
