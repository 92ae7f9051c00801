//! Change ingestion: the durable event log and the loops that consume it.
//!
//! Entity insert events warm the cache and the existence filters. Vote events are replayed into
//! the authoritative store. Both loops commit a message only after its side effect completed.

mod consumer;
mod error;
mod log;
mod memory;
mod messages;
mod redis;

pub use consumer::{
    BatchReport, EntityIngestor, EntityWarmer, Handled, Ingestor, IngestorSettings,
    MessageHandler, VoteReplayIngestor, VoteReplayer,
};
pub use error::IngestError;
pub use log::{EventSink, EventSource, LogError, LogMessage};
pub use memory::{MemoryEventLog, MemoryStreamSource};
pub use messages::{
    CHANGE_EVENT_KEY, ChangeEvent, CommunityRow, MessageError, PostRow, VOTE_EVENT_KEY, VoteEvent,
};
pub use self::redis::{RedisStreamLog, RedisStreamSink};
