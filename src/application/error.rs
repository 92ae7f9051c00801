use std::error::Error as StdError;
use std::fmt;

use axum::{http::StatusCode, response::Response};
use thiserror::Error;

use crate::application::repos::RepoError;
use crate::cache::CacheError;
use crate::domain::error::DomainError;
use crate::infra::error::InfraError;
use crate::ingest::{LogError, MessageError};

/// Internal diagnostics attached to an HTTP response for the logging middleware.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub source: &'static str,
    pub status: StatusCode,
    pub messages: Vec<String>,
}

impl ErrorReport {
    pub fn from_error(source: &'static str, status: StatusCode, error: &dyn StdError) -> Self {
        let mut messages = vec![error.to_string()];
        let mut current = error.source();
        while let Some(inner) = current {
            messages.push(inner.to_string());
            current = inner.source();
        }
        Self {
            source,
            status,
            messages,
        }
    }

    pub fn from_message(
        source: &'static str,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self {
            source,
            status,
            messages: vec![message.into()],
        }
    }

    pub fn attach(self, response: &mut Response) {
        response.extensions_mut().insert(self);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    RepeatedVote,
    DuplicateCommunity,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::RepeatedVote => "repeated_vote",
            ConflictKind::DuplicateCommunity => "duplicate_community",
        }
    }
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which collaborator failed for a [`AppError::Transient`] outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Cache,
    Database,
    EventLog,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Cache => "cache",
            Backend::Database => "database",
            Backend::EventLog => "event_log",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Service outcome. `Clone` so one coalesced result can reach every waiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AppError {
    #[error("{entity} not found")]
    NotFound { entity: &'static str },
    #[error("conflict: {0}")]
    Conflict(ConflictKind),
    #[error("invalid page cursor")]
    InvalidCursor,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{backend} unavailable: {message}")]
    Transient { backend: Backend, message: String },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn not_found(entity: &'static str) -> Self {
        Self::NotFound { entity }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn transient(backend: Backend, message: impl Into<String>) -> Self {
        Self::Transient {
            backend,
            message: message.into(),
        }
    }

    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound { .. })
    }

    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound { .. } => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::InvalidCursor => "invalid_cursor",
            AppError::Validation(_) => "validation",
            AppError::Transient { .. } => "transient",
            AppError::Unexpected(_) => "unexpected",
        }
    }
}

impl From<DomainError> for AppError {
    fn from(error: DomainError) -> Self {
        match error {
            DomainError::NotFound { entity, .. } => AppError::NotFound { entity },
            DomainError::RepeatedVote { .. } => AppError::Conflict(ConflictKind::RepeatedVote),
            DomainError::DuplicateCommunity { .. } => {
                AppError::Conflict(ConflictKind::DuplicateCommunity)
            }
            DomainError::Validation { message } => AppError::Validation(message),
        }
    }
}

impl From<CacheError> for AppError {
    fn from(error: CacheError) -> Self {
        match error {
            CacheError::Unavailable(message) => AppError::transient(Backend::Cache, message),
            corrupt @ CacheError::Corrupt { .. } => AppError::Unexpected(corrupt.to_string()),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(error: RepoError) -> Self {
        match error {
            RepoError::NotFound => AppError::not_found("record"),
            RepoError::InvalidInput { message } => AppError::Validation(message),
            RepoError::Timeout => AppError::transient(Backend::Database, "database timeout"),
            RepoError::Persistence(message) => AppError::transient(Backend::Database, message),
            other @ (RepoError::Duplicate { .. } | RepoError::Integrity { .. }) => {
                AppError::Unexpected(other.to_string())
            }
        }
    }
}

impl From<LogError> for AppError {
    fn from(error: LogError) -> Self {
        match error {
            LogError::Encode(message) => AppError::Unexpected(message),
            other => AppError::transient(Backend::EventLog, other.to_string()),
        }
    }
}

impl From<InfraError> for AppError {
    fn from(error: InfraError) -> Self {
        AppError::Unexpected(error.to_string())
    }
}

impl From<MessageError> for AppError {
    fn from(error: MessageError) -> Self {
        AppError::Unexpected(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_outage_is_transient_but_corruption_is_not() {
        let outage = AppError::from(CacheError::unavailable("connection refused"));
        assert!(matches!(
            outage,
            AppError::Transient {
                backend: Backend::Cache,
                ..
            }
        ));

        let corrupt = AppError::from(CacheError::corrupt("lightning:post:1", "bad field"));
        assert_eq!(corrupt.kind(), "unexpected");
    }

    #[test]
    fn domain_conflicts_keep_their_kind() {
        let err = AppError::from(DomainError::RepeatedVote {
            post_id: 1,
            user_id: 2,
            value: crate::domain::types::VoteValue::Up,
        });
        assert_eq!(err, AppError::Conflict(ConflictKind::RepeatedVote));
        assert_eq!(err.to_string(), "conflict: repeated_vote");
    }

    #[test]
    fn error_report_walks_the_source_chain() {
        #[derive(Debug, Error)]
        #[error("outer")]
        struct Outer(#[source] std::io::Error);

        let err = Outer(std::io::Error::other("inner"));
        let report = ErrorReport::from_error("test", StatusCode::BAD_GATEWAY, &err);
        assert_eq!(report.messages, vec!["outer".to_string(), "inner".to_string()]);
    }
}
