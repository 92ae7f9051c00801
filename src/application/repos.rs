//! Repository traits describing the authoritative store.

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::entities::{CommunityRecord, PostRecord, VoteBallot};

#[derive(Debug, Clone, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("duplicate record violates unique constraint `{constraint}`")]
    Duplicate { constraint: String },
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct CreateCommunityParams {
    pub id: i64,
    pub name: String,
    pub introduction: String,
}

#[derive(Debug, Clone)]
pub struct CreatePostParams {
    pub id: i64,
    pub author_id: i64,
    pub community_id: i64,
    pub title: String,
    pub content: String,
}

/// Which branch a ballot upsert took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BallotWrite {
    Inserted,
    Updated,
}

impl BallotWrite {
    pub fn as_str(self) -> &'static str {
        match self {
            BallotWrite::Inserted => "inserted",
            BallotWrite::Updated => "updated",
        }
    }
}

#[async_trait]
pub trait CommunitiesRepo: Send + Sync {
    async fn community_exists(&self, id: i64) -> Result<bool, RepoError>;

    async fn find_community(&self, id: i64) -> Result<Option<CommunityRecord>, RepoError>;

    /// All communities ordered by creation time.
    async fn list_communities(&self) -> Result<Vec<CommunityRecord>, RepoError>;

    async fn list_community_ids(&self) -> Result<Vec<i64>, RepoError>;

    async fn create_community(
        &self,
        params: CreateCommunityParams,
    ) -> Result<CommunityRecord, RepoError>;
}

#[async_trait]
pub trait PostsRepo: Send + Sync {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError>;

    async fn list_post_ids(&self) -> Result<Vec<i64>, RepoError>;

    async fn create_post(&self, params: CreatePostParams) -> Result<PostRecord, RepoError>;
}

#[async_trait]
pub trait UsersRepo: Send + Sync {
    async fn find_username(&self, user_id: i64) -> Result<Option<String>, RepoError>;
}

#[async_trait]
pub trait VotesRepo: Send + Sync {
    /// Insert the ballot or overwrite the value of the existing `(post, user)` row.
    ///
    /// Applying the same ballot twice leaves exactly one row holding the latest value.
    async fn upsert_ballot(&self, ballot: &VoteBallot) -> Result<BallotWrite, RepoError>;

    async fn find_ballot(&self, post_id: i64, user_id: i64)
    -> Result<Option<VoteBallot>, RepoError>;
}
