//! Durable event log seam shared by the Redis Streams and in-process transports.

use async_trait::async_trait;
use thiserror::Error;

/// One entry read from a stream on behalf of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub id: String,
    pub stream: String,
    pub key: String,
    pub payload: String,
    /// `true` when the entry was handed out before and never committed.
    pub redelivered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LogError {
    #[error("event log unavailable: {0}")]
    Unavailable(String),
    #[error("event could not be encoded: {0}")]
    Encode(String),
    #[error("event log closed")]
    Closed,
}

impl LogError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Consumer side of one stream.
///
/// Fetched messages stay pending until committed. After [`EventSource::rewind`] the next fetches
/// hand out the pending messages again, oldest first, before any new ones.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn stream(&self) -> &str;

    /// Up to `max` messages. May wait briefly for new entries and return an empty batch.
    async fn fetch(&self, max: usize) -> Result<Vec<LogMessage>, LogError>;

    async fn commit(&self, message: &LogMessage) -> Result<(), LogError>;

    async fn rewind(&self) -> Result<(), LogError>;

    async fn close(&self);
}

/// Producer side, shared by every stream.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append an entry and return its id.
    async fn publish(&self, stream: &str, key: &str, payload: &str) -> Result<String, LogError>;
}
