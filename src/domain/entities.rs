//! Domain entities mirrored from persistent storage.

use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::types::VoteValue;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommunityRecord {
    pub id: i64,
    pub name: String,
    pub introduction: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// Lightweight `(id, name)` projection served by the community list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommunitySummary {
    pub id: i64,
    pub name: String,
}

impl From<&CommunityRecord> for CommunitySummary {
    fn from(record: &CommunityRecord) -> Self {
        Self {
            id: record.id,
            name: record.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostRecord {
    pub id: i64,
    pub author_id: i64,
    pub community_id: i64,
    pub title: String,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoteBallot {
    pub post_id: i64,
    pub user_id: i64,
    pub value: VoteValue,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A post enriched with the data readers see next to it.
///
/// Enrichment is best-effort: a missing community or author name means the lookup failed and was
/// logged, not that the post is broken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostDetail {
    #[serde(flatten)]
    pub post: PostRecord,
    pub author_name: Option<String>,
    pub vote_count: i64,
    pub community: Option<CommunityRecord>,
}
