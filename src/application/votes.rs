//! Vote casting: ballot transitions, rank score updates and the durable vote event.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info};

use crate::application::error::AppError;
use crate::cache::{BallotTransition, CacheStore, ExistenceFilter};
use crate::domain::error::DomainError;
use crate::domain::types::VoteValue;
use crate::infra::telemetry::{METRIC_FILTER_REJECT_TOTAL, METRIC_VOTE_CAST_TOTAL};
use crate::ingest::{EventSink, VOTE_EVENT_KEY, VoteEvent};

const SOURCE: &str = "application::votes";

/// Score worth of one vote: 200 net up-votes keep a post as prominent as one a day younger.
pub const SCORE_PER_VOTE: f64 = 432.0;

/// Outcome of an accepted vote.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoteReceipt {
    pub post_id: i64,
    pub previous: VoteValue,
    pub current: VoteValue,
    pub score_delta: f64,
}

pub struct VoteLedger {
    cache: Arc<dyn CacheStore>,
    posts: Arc<ExistenceFilter>,
    sink: Arc<dyn EventSink>,
    vote_stream: String,
}

impl VoteLedger {
    pub fn new(
        cache: Arc<dyn CacheStore>,
        posts: Arc<ExistenceFilter>,
        sink: Arc<dyn EventSink>,
        vote_stream: impl Into<String>,
    ) -> Self {
        Self {
            cache,
            posts,
            sink,
            vote_stream: vote_stream.into(),
        }
    }

    /// Apply `value` as `user_id`'s ballot on `post_id`.
    ///
    /// The repeat check, the ballot and the score move together in one atomic cache step; the vote
    /// event that makes the ballot durable is published afterwards. A repeat of the current ballot
    /// is a conflict and changes nothing, even when it races the vote it repeats.
    pub async fn cast(
        &self,
        user_id: i64,
        post_id: i64,
        value: VoteValue,
    ) -> Result<VoteReceipt, AppError> {
        let result = self.cast_inner(user_id, post_id, value).await;
        let outcome = match &result {
            Ok(_) => "accepted",
            Err(AppError::Conflict(_)) => "repeated",
            Err(err) if err.is_not_found() => "unknown_post",
            Err(_) => "failed",
        };
        counter!(METRIC_VOTE_CAST_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn cast_inner(
        &self,
        user_id: i64,
        post_id: i64,
        value: VoteValue,
    ) -> Result<VoteReceipt, AppError> {
        if !self.posts.might_exist(post_id) {
            counter!(METRIC_FILTER_REJECT_TOTAL, "kind" => "post").increment(1);
            debug!(target = SOURCE, post_id, "Existence filter rejected vote target");
            return Err(AppError::not_found("post"));
        }

        let event = VoteEvent {
            post_id,
            user_id,
            vote_type: value,
            create_time: OffsetDateTime::now_utc(),
        }
        .encode()?;

        let Some(transition) = self
            .cache
            .transition_ballot(post_id, user_id, value, SCORE_PER_VOTE)
            .await?
        else {
            debug!(
                target = SOURCE,
                post_id,
                user_id,
                value = %value,
                "Rejected repeated vote"
            );
            return Err(DomainError::RepeatedVote {
                post_id,
                user_id,
                value,
            }
            .into());
        };
        let BallotTransition {
            previous,
            score_delta,
        } = transition;

        if let Err(err) = self
            .sink
            .publish(&self.vote_stream, VOTE_EVENT_KEY, &event)
            .await
        {
            error!(
                target = SOURCE,
                post_id,
                user_id,
                stream = %self.vote_stream,
                error = %err,
                "Failed to publish vote event"
            );
            return Err(err.into());
        }

        info!(
            target = SOURCE,
            post_id,
            user_id,
            previous = %previous,
            current = %value,
            score_delta,
            "Vote cast"
        );
        Ok(VoteReceipt {
            post_id,
            previous,
            current: value,
            score_delta,
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{FilterSizing, MemoryCacheStore};
    use crate::ingest::MemoryEventLog;

    use super::*;

    #[test]
    fn delta_follows_value_distance() {
        let delta = |previous, requested| {
            BallotTransition::between(previous, requested, SCORE_PER_VOTE)
                .map(|transition| transition.score_delta)
        };
        assert_eq!(delta(VoteValue::Neutral, VoteValue::Up), Some(432.0));
        assert_eq!(delta(VoteValue::Up, VoteValue::Down), Some(-864.0));
        assert_eq!(delta(VoteValue::Down, VoteValue::Neutral), Some(432.0));
        assert_eq!(delta(VoteValue::Up, VoteValue::Up), None);
        assert_eq!(delta(VoteValue::Neutral, VoteValue::Neutral), None);
    }

    fn ledger(post_ids: &[i64]) -> (VoteLedger, MemoryEventLog) {
        let filter = ExistenceFilter::load_from(
            FilterSizing {
                expected_items: 1_000,
                ..FilterSizing::default()
            },
            post_ids.iter().copied(),
        );
        let log = MemoryEventLog::new();
        let ledger = VoteLedger::new(
            Arc::new(MemoryCacheStore::new()),
            Arc::new(filter),
            Arc::new(log.clone()),
            "votes",
        );
        (ledger, log)
    }

    #[tokio::test]
    async fn repeated_vote_is_a_conflict_and_publishes_nothing() {
        let (ledger, log) = ledger(&[7]);
        ledger.cast(1, 7, VoteValue::Up).await.expect("first vote");
        let err = ledger.cast(1, 7, VoteValue::Up).await.expect_err("repeat");
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(log.len("votes"), 1);
    }

    #[tokio::test]
    async fn unknown_post_is_rejected_before_touching_the_cache() {
        let (ledger, log) = ledger(&[7]);
        let err = ledger.cast(1, 8, VoteValue::Up).await.expect_err("unknown");
        assert!(err.is_not_found());
        assert!(log.is_empty("votes"));
    }

    #[tokio::test]
    async fn published_event_carries_the_new_ballot() {
        let (ledger, log) = ledger(&[7]);
        let receipt = ledger.cast(3, 7, VoteValue::Down).await.expect("vote");
        assert_eq!(receipt.previous, VoteValue::Neutral);
        assert_eq!(receipt.score_delta, -432.0);

        let entries = log.entries("votes");
        assert_eq!(entries.len(), 1);
        let (key, payload) = &entries[0];
        assert_eq!(key, VOTE_EVENT_KEY);
        let event = VoteEvent::decode(payload).expect("event");
        assert_eq!((event.post_id, event.user_id), (7, 3));
        assert_eq!(event.vote_type, VoteValue::Down);
    }
}
