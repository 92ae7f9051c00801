//! Cache store contract shared by the Redis and in-process backends.
//!
//! Reads return a three-way outcome: `Ok(CacheLookup::Found(_))`, `Ok(CacheLookup::NotFound)`
//! or `Err(CacheError)`. Callers branch on the variant; only `NotFound` may fall through to the
//! authoritative store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{CommunityRecord, CommunitySummary, PostRecord};
use crate::domain::types::{RankOrder, VoteValue};
use crate::util::time::{format_timestamp, parse_timestamp};

/// Outcome of a cache read that reached the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<T> {
    Found(T),
    NotFound,
}

impl<T> CacheLookup<T> {
    pub fn found(self) -> Option<T> {
        match self {
            CacheLookup::Found(value) => Some(value),
            CacheLookup::NotFound => None,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, CacheLookup::Found(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache backend unavailable: {0}")]
    Unavailable(String),
    #[error("cache entry `{key}` is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
}

impl CacheError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    pub fn corrupt(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// An applied ballot change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BallotTransition {
    pub previous: VoteValue,
    pub score_delta: f64,
}

impl BallotTransition {
    /// The change from `previous` to `requested`, or `None` for a repeat.
    pub fn between(previous: VoteValue, requested: VoteValue, score_per_vote: f64) -> Option<Self> {
        if previous == requested {
            return None;
        }
        let steps = requested.as_i8() - previous.as_i8();
        Some(Self {
            previous,
            score_delta: f64::from(steps) * score_per_vote,
        })
    }
}

/// Every cache operation the read, vote and ingest paths need.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn community(&self, id: i64) -> Result<CacheLookup<CommunityRecord>, CacheError>;

    /// Write the community hash and rank it in the community list. Neither expires.
    async fn put_community(&self, community: &CommunityRecord) -> Result<(), CacheError>;

    /// Write the community hash only, leaving the community list untouched.
    async fn backfill_community(&self, community: &CommunityRecord) -> Result<(), CacheError>;

    /// Community `(id, name)` pairs in creation order. An empty list reads as `NotFound`.
    async fn community_list(&self) -> Result<CacheLookup<Vec<CommunitySummary>>, CacheError>;

    async fn post(&self, id: i64) -> Result<CacheLookup<PostRecord>, CacheError>;

    /// Warm a newly created post: hash with `ttl`, both global rank sets scored by creation time,
    /// and the community membership set, in one atomic batch.
    async fn put_fresh_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError>;

    /// Write the post hash only, after a read-through from the authoritative store.
    async fn backfill_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError>;

    /// Current ballot of `user_id` on `post_id`; no ballot reads as `Neutral`.
    async fn ballot(&self, post_id: i64, user_id: i64) -> Result<VoteValue, CacheError>;

    /// Move the ballot of `user_id` on `post_id` to `value` and shift the post's global score by
    /// `(value - previous) * score_per_vote`, as one atomic step.
    ///
    /// Returns `None` and changes nothing when `value` is already the current ballot.
    async fn transition_ballot(
        &self,
        post_id: i64,
        user_id: i64,
        value: VoteValue,
        score_per_vote: f64,
    ) -> Result<Option<BallotTransition>, CacheError>;

    /// Net vote count: the sum of all ballot values on the post.
    async fn vote_count(&self, post_id: i64) -> Result<i64, CacheError>;

    async fn rank_score(&self, order: RankOrder, post_id: i64) -> Result<Option<f64>, CacheError>;

    /// Materialize the community's rank set for `order` unless a live copy exists.
    ///
    /// Returns `true` when the set was (re)derived.
    async fn derive_community_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    /// Zero-based position of `post_id` in the community rank set, highest score first.
    async fn community_reverse_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        post_id: i64,
    ) -> Result<Option<u64>, CacheError>;

    /// Up to `count` post ids from position `start`, highest score first.
    async fn community_reverse_range(
        &self,
        community_id: i64,
        order: RankOrder,
        start: u64,
        count: u64,
    ) -> Result<Vec<i64>, CacheError>;

    async fn store_refresh_token(
        &self,
        user_id: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn refresh_token(&self, user_id: i64) -> Result<CacheLookup<String>, CacheError>;
}

// ============================================================================
// Hash field encoding
// ============================================================================

pub(crate) const FIELD_COMMUNITY_ID: &str = "community_id";
pub(crate) const FIELD_COMMUNITY_NAME: &str = "community_name";
const FIELD_INTRODUCTION: &str = "introduction";
const FIELD_CREATE_TIME: &str = "create_time";
const FIELD_POST_ID: &str = "post_id";
const FIELD_TITLE: &str = "title";
const FIELD_CONTENT: &str = "content";
const FIELD_AUTHOR_ID: &str = "author_id";

pub(crate) fn community_fields(community: &CommunityRecord) -> Vec<(&'static str, String)> {
    vec![
        (FIELD_COMMUNITY_ID, community.id.to_string()),
        (FIELD_COMMUNITY_NAME, community.name.clone()),
        (FIELD_INTRODUCTION, community.introduction.clone()),
        (FIELD_CREATE_TIME, format_timestamp(community.created_at)),
    ]
}

pub(crate) fn community_from_fields(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<CommunityRecord, CacheError> {
    Ok(CommunityRecord {
        id: int_field(key, fields, FIELD_COMMUNITY_ID)?,
        name: text_field(fields, FIELD_COMMUNITY_NAME),
        introduction: text_field(fields, FIELD_INTRODUCTION),
        created_at: time_field(key, fields, FIELD_CREATE_TIME)?,
    })
}

pub(crate) fn post_fields(post: &PostRecord) -> Vec<(&'static str, String)> {
    vec![
        (FIELD_POST_ID, post.id.to_string()),
        (FIELD_TITLE, post.title.clone()),
        (FIELD_CONTENT, post.content.clone()),
        (FIELD_AUTHOR_ID, post.author_id.to_string()),
        (FIELD_COMMUNITY_ID, post.community_id.to_string()),
        (FIELD_CREATE_TIME, format_timestamp(post.created_at)),
    ]
}

pub(crate) fn post_from_fields(
    key: &str,
    fields: &HashMap<String, String>,
) -> Result<PostRecord, CacheError> {
    Ok(PostRecord {
        id: int_field(key, fields, FIELD_POST_ID)?,
        author_id: int_field(key, fields, FIELD_AUTHOR_ID)?,
        community_id: int_field(key, fields, FIELD_COMMUNITY_ID)?,
        title: text_field(fields, FIELD_TITLE),
        content: text_field(fields, FIELD_CONTENT),
        created_at: time_field(key, fields, FIELD_CREATE_TIME)?,
    })
}

/// Rank-set score of a freshly created post: its creation time in unix seconds.
pub(crate) fn creation_score(post: &PostRecord) -> f64 {
    post.created_at.unix_timestamp() as f64
}

/// Parse a ballot value stored in a ballot map.
pub(crate) fn parse_ballot(key: &str, raw: &str) -> Result<VoteValue, CacheError> {
    raw.trim()
        .parse::<i8>()
        .map_err(|err| CacheError::corrupt(key, format!("ballot `{raw}`: {err}")))
        .and_then(|value| {
            VoteValue::try_from(value).map_err(|err| CacheError::corrupt(key, err.to_string()))
        })
}

fn text_field(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn int_field(key: &str, fields: &HashMap<String, String>, name: &str) -> Result<i64, CacheError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| CacheError::corrupt(key, format!("missing field `{name}`")))?;
    raw.parse()
        .map_err(|err| CacheError::corrupt(key, format!("field `{name}`: {err}")))
}

fn time_field(
    key: &str,
    fields: &HashMap<String, String>,
    name: &str,
) -> Result<time::OffsetDateTime, CacheError> {
    let raw = fields
        .get(name)
        .ok_or_else(|| CacheError::corrupt(key, format!("missing field `{name}`")))?;
    parse_timestamp(raw).map_err(|err| CacheError::corrupt(key, format!("field `{name}`: {err}")))
}
