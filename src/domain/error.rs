use thiserror::Error;

use super::types::VoteValue;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DomainError {
    #[error("{entity} `{id}` does not exist")]
    NotFound { entity: &'static str, id: i64 },
    #[error("user {user_id} already voted {value} on post {post_id}")]
    RepeatedVote {
        post_id: i64,
        user_id: i64,
        value: VoteValue,
    },
    #[error("community `{id}` already exists")]
    DuplicateCommunity { id: i64 },
    #[error("domain validation failed: {message}")]
    Validation { message: String },
}

impl DomainError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }
}
