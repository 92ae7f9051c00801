//! Consuming loops that apply event log messages and commit them only after the side effect
//! completed.
//!
//! A message whose side effect failed is left uncommitted, whatever the cause. The loop then backs
//! off, rewinds the source and receives the pending messages again before any new ones, so
//! effects stay in stream order and are applied at least once. Only a malformed message, which no
//! redelivery can fix, is logged and committed without an effect.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use metrics::{counter, histogram};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::repos::VotesRepo;
use crate::cache::{CachePolicy, CacheStore, ExistenceFilter};
use crate::domain::entities::{CommunityRecord, PostRecord, VoteBallot};
use crate::infra::telemetry::{METRIC_INGEST_HANDLE_MS, METRIC_INGEST_MESSAGE_TOTAL};

use super::error::IngestError;
use super::log::{EventSource, LogError, LogMessage};
use super::messages::{
    ChangeEvent, CommunityRow, MessageError, PostRow, VOTE_EVENT_KEY, VoteEvent,
};

const SOURCE: &str = "ingest::consumer";

/// What a handler did with a message it could process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    Applied,
    Skipped,
}

/// Applies one message. Must be idempotent: a message can be delivered more than once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, message: &LogMessage) -> Result<Handled, IngestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestorSettings {
    pub batch_size: usize,
    pub retry_backoff: Duration,
}

impl Default for IngestorSettings {
    fn default() -> Self {
        Self {
            batch_size: 64,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Result of one fetch-and-apply round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub applied: usize,
    pub skipped: usize,
    pub malformed: usize,
    /// A side effect failed; that message and everything after it in the batch await redelivery.
    pub retry: bool,
}

impl BatchReport {
    pub fn committed(&self) -> usize {
        self.applied + self.skipped + self.malformed
    }
}

pub struct Ingestor<H> {
    source: Arc<dyn EventSource>,
    handler: H,
    settings: IngestorSettings,
}

impl<H: MessageHandler> Ingestor<H> {
    pub fn new(source: Arc<dyn EventSource>, handler: H, settings: IngestorSettings) -> Self {
        Self {
            source,
            handler,
            settings,
        }
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Fetch one batch and apply it in order.
    pub async fn poll_once(&self) -> Result<BatchReport, LogError> {
        let batch = self.source.fetch(self.settings.batch_size).await?;
        self.apply(&batch).await
    }

    /// Apply messages in order, committing each one that reached a final outcome.
    ///
    /// On a failed side effect the source is rewound and the rest of the batch is left for
    /// redelivery.
    async fn apply(&self, batch: &[LogMessage]) -> Result<BatchReport, LogError> {
        let mut report = BatchReport::default();

        for message in batch {
            let started_at = Instant::now();
            let outcome = self.handler.handle(message).await;
            histogram!(METRIC_INGEST_HANDLE_MS, "stream" => message.stream.clone())
                .record(started_at.elapsed().as_secs_f64() * 1000.0);

            let label = match outcome {
                Ok(Handled::Applied) => {
                    report.applied += 1;
                    "applied"
                }
                Ok(Handled::Skipped) => {
                    report.skipped += 1;
                    "skipped"
                }
                Err(err) if err.is_malformed() => {
                    warn!(
                        target = SOURCE,
                        handler = self.handler.name(),
                        stream = %message.stream,
                        id = %message.id,
                        error = %err,
                        "Skipping malformed message"
                    );
                    report.malformed += 1;
                    "malformed"
                }
                Err(err) => {
                    let label = if err.is_retryable() {
                        warn!(
                            target = SOURCE,
                            handler = self.handler.name(),
                            stream = %message.stream,
                            id = %message.id,
                            redelivered = message.redelivered,
                            error = %err,
                            "Message failed transiently, leaving it for redelivery"
                        );
                        "retry"
                    } else {
                        error!(
                            target = SOURCE,
                            handler = self.handler.name(),
                            stream = %message.stream,
                            id = %message.id,
                            redelivered = message.redelivered,
                            error = %err,
                            "Message was rejected by its side effect, holding the stream"
                        );
                        "failed"
                    };
                    counter!(
                        METRIC_INGEST_MESSAGE_TOTAL,
                        "stream" => message.stream.clone(),
                        "outcome" => label
                    )
                    .increment(1);
                    report.retry = true;
                    self.source.rewind().await?;
                    return Ok(report);
                }
            };

            counter!(
                METRIC_INGEST_MESSAGE_TOTAL,
                "stream" => message.stream.clone(),
                "outcome" => label
            )
            .increment(1);
            self.source.commit(message).await?;
        }

        Ok(report)
    }

    /// Consume until `cancel` fires or the source closes.
    ///
    /// Cancellation is observed while waiting for messages or backing off, never in the middle
    /// of applying one.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            target = SOURCE,
            handler = self.handler.name(),
            stream = self.source.stream(),
            "Ingestor started"
        );

        loop {
            let fetched = tokio::select! {
                _ = cancel.cancelled() => break,
                fetched = self.source.fetch(self.settings.batch_size) => fetched,
            };
            let polled = match fetched {
                Ok(batch) => self.apply(&batch).await,
                Err(err) => Err(err),
            };

            let back_off = match polled {
                Ok(report) => {
                    if report.committed() > 0 {
                        debug!(
                            target = SOURCE,
                            handler = self.handler.name(),
                            applied = report.applied,
                            skipped = report.skipped,
                            malformed = report.malformed,
                            "Applied batch"
                        );
                    }
                    report.retry
                }
                Err(LogError::Closed) => break,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        handler = self.handler.name(),
                        stream = self.source.stream(),
                        error = %err,
                        "Event log operation failed"
                    );
                    if let Err(err) = self.source.rewind().await {
                        warn!(target = SOURCE, error = %err, "Failed to rewind event log");
                    }
                    true
                }
            };

            if back_off {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.retry_backoff) => {}
                }
            }
        }

        self.source.close().await;
        info!(
            target = SOURCE,
            handler = self.handler.name(),
            stream = self.source.stream(),
            "Ingestor stopped"
        );
    }
}

// ============================================================================
// Entity warming
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntityTable {
    Community,
    Post,
}

impl EntityTable {
    fn from_table(table: &str) -> Option<Self> {
        let name = table.rsplit('.').next().unwrap_or(table);
        match name.to_ascii_lowercase().as_str() {
            "community" | "communities" => Some(EntityTable::Community),
            "post" | "posts" => Some(EntityTable::Post),
            _ => None,
        }
    }
}

/// Warms entity hashes, rank sets and existence filters from row insert events.
pub struct EntityWarmer {
    cache: Arc<dyn CacheStore>,
    communities: Arc<ExistenceFilter>,
    posts: Arc<ExistenceFilter>,
    policy: CachePolicy,
}

impl EntityWarmer {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        communities: Arc<ExistenceFilter>,
        posts: Arc<ExistenceFilter>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            cache,
            communities,
            posts,
            policy,
        }
    }

    async fn warm_community(&self, community: CommunityRecord) -> Result<(), IngestError> {
        self.cache.put_community(&community).await?;
        self.communities.add(community.id);
        debug!(target = SOURCE, community_id = community.id, "Warmed community");
        Ok(())
    }

    async fn warm_post(&self, post: PostRecord) -> Result<(), IngestError> {
        self.cache
            .put_fresh_post(&post, self.policy.fresh_entity_ttl)
            .await?;
        self.posts.add(post.id);
        debug!(
            target = SOURCE,
            post_id = post.id,
            community_id = post.community_id,
            "Warmed post"
        );
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for EntityWarmer {
    fn name(&self) -> &'static str {
        "entity_warmer"
    }

    async fn handle(&self, message: &LogMessage) -> Result<Handled, IngestError> {
        let event = ChangeEvent::decode(&message.payload)?;
        if !event.is_insert() {
            return Ok(Handled::Skipped);
        }
        let Some(table) = EntityTable::from_table(&event.table) else {
            debug!(
                target = SOURCE,
                table = %event.table,
                id = %message.id,
                "Ignoring change for untracked table"
            );
            return Ok(Handled::Skipped);
        };
        if event.data.is_empty() {
            return Err(MessageError::Malformed {
                field: "data",
                reason: "insert event carries no rows".to_string(),
            }
            .into());
        }

        let mut applied = 0;
        let mut first_malformed = None;
        for row in &event.data {
            let parsed = match table {
                EntityTable::Community => {
                    CommunityRow::parse(row).map(|row| Entity::Community(row.into()))
                }
                EntityTable::Post => PostRow::parse(row).map(|row| Entity::Post(row.into())),
            };
            match parsed {
                Ok(Entity::Community(record)) => self.warm_community(record).await?,
                Ok(Entity::Post(record)) => self.warm_post(record).await?,
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        table = %event.table,
                        id = %message.id,
                        error = %err,
                        "Skipping malformed row"
                    );
                    if first_malformed.is_none() {
                        first_malformed = Some(err);
                    }
                    continue;
                }
            }
            applied += 1;
        }

        match (applied, first_malformed) {
            (0, Some(err)) => Err(err.into()),
            _ => Ok(Handled::Applied),
        }
    }
}

enum Entity {
    Community(CommunityRecord),
    Post(PostRecord),
}

// ============================================================================
// Vote replay
// ============================================================================

/// Persists vote events into the authoritative store with an upsert per `(post, user)`.
pub struct VoteReplayer {
    votes: Arc<dyn VotesRepo>,
}

impl VoteReplayer {
    pub fn new(votes: Arc<dyn VotesRepo>) -> Self {
        Self { votes }
    }
}

#[async_trait]
impl MessageHandler for VoteReplayer {
    fn name(&self) -> &'static str {
        "vote_replayer"
    }

    async fn handle(&self, message: &LogMessage) -> Result<Handled, IngestError> {
        if message.key != VOTE_EVENT_KEY {
            debug!(
                target = SOURCE,
                key = %message.key,
                id = %message.id,
                "Ignoring message with foreign key"
            );
            return Ok(Handled::Skipped);
        }
        let event = VoteEvent::decode(&message.payload)?;
        let ballot = VoteBallot::from(event);
        let write = self.votes.upsert_ballot(&ballot).await?;
        debug!(
            target = SOURCE,
            post_id = ballot.post_id,
            user_id = ballot.user_id,
            value = %ballot.value,
            write = write.as_str(),
            redelivered = message.redelivered,
            "Persisted ballot"
        );
        Ok(Handled::Applied)
    }
}

pub type EntityIngestor = Ingestor<EntityWarmer>;
pub type VoteReplayIngestor = Ingestor<VoteReplayer>;
