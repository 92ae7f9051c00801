use thiserror::Error;

use crate::application::repos::RepoError;
use crate::cache::CacheError;

use super::log::LogError;
use super::messages::MessageError;

#[derive(Debug, Clone, Error)]
pub enum IngestError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Log(#[from] LogError),
}

impl IngestError {
    /// Whether redelivering the same message can succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            IngestError::Message(_) => false,
            IngestError::Cache(err) => matches!(err, CacheError::Unavailable(_)),
            IngestError::Repo(err) => matches!(err, RepoError::Persistence(_) | RepoError::Timeout),
            IngestError::Log(err) => !matches!(err, LogError::Encode(_)),
        }
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, IngestError::Message(_))
    }
}
