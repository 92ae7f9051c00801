use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::application::error::{AppError, ConflictKind, ErrorReport};

#[derive(Debug, Serialize)]
pub struct ApiErrorBody {
    pub error: ApiErrorMessage,
}

pub mod codes {
    pub const BAD_REQUEST: &str = "bad_request";
    pub const UNAUTHORIZED: &str = "unauthorized";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT_REPEATED_VOTE: &str = "conflict_repeated_vote";
    pub const CONFLICT_DUPLICATE_COMMUNITY: &str = "conflict_duplicate_community";
    pub const INVALID_CURSOR: &str = "invalid_cursor";
    pub const INVALID_INPUT: &str = "invalid_input";
    pub const SERVER_BUSY: &str = "server_busy";
}

#[derive(Debug, Serialize)]
pub struct ApiErrorMessage {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: &'static str,
    hint: Option<String>,
    report: Option<ErrorReport>,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        code: &'static str,
        message: &'static str,
        hint: Option<String>,
    ) -> Self {
        Self {
            status,
            code,
            message,
            hint,
            report: None,
        }
    }

    pub fn bad_request(message: &'static str, hint: Option<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, codes::BAD_REQUEST, message, hint)
    }

    pub fn unauthorized() -> Self {
        Self::new(
            StatusCode::UNAUTHORIZED,
            codes::UNAUTHORIZED,
            "Acting user required",
            Some("send the user id in the x-user-id header".to_string()),
        )
    }

    pub fn not_found(message: &'static str) -> Self {
        Self::new(StatusCode::NOT_FOUND, codes::NOT_FOUND, message, None)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    /// Map a service outcome onto the public error set. Internal detail only reaches the
    /// attached [`ErrorReport`].
    pub fn from_app(source: &'static str, err: AppError) -> Self {
        let (status, code, message, hint) = match &err {
            AppError::NotFound { entity } => (
                StatusCode::NOT_FOUND,
                codes::NOT_FOUND,
                "Resource not found",
                Some(format!("{entity} does not exist")),
            ),
            AppError::Conflict(ConflictKind::RepeatedVote) => (
                StatusCode::CONFLICT,
                codes::CONFLICT_REPEATED_VOTE,
                "Vote already recorded",
                None,
            ),
            AppError::Conflict(ConflictKind::DuplicateCommunity) => (
                StatusCode::CONFLICT,
                codes::CONFLICT_DUPLICATE_COMMUNITY,
                "Community already exists",
                None,
            ),
            AppError::InvalidCursor => (
                StatusCode::BAD_REQUEST,
                codes::INVALID_CURSOR,
                "Invalid page token",
                None,
            ),
            AppError::Validation(reason) => (
                StatusCode::BAD_REQUEST,
                codes::INVALID_INPUT,
                "Invalid input",
                Some(reason.clone()),
            ),
            AppError::Transient { .. } => (
                StatusCode::SERVICE_UNAVAILABLE,
                codes::SERVER_BUSY,
                "Server busy",
                None,
            ),
            AppError::Unexpected(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                codes::SERVER_BUSY,
                "Server busy",
                None,
            ),
        };

        let mut api = Self::new(status, code, message, hint);
        api.report = Some(ErrorReport::from_error(source, status, &err));
        api
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let report = self.report.unwrap_or_else(|| {
            ErrorReport::from_message(
                "infra::http",
                self.status,
                format!(
                    "{}: {}",
                    self.code,
                    self.hint.as_deref().unwrap_or(self.message)
                ),
            )
        });
        let body = ApiErrorBody {
            error: ApiErrorMessage {
                code: self.code.to_string(),
                message: self.message.to_string(),
                hint: self.hint,
            },
        };
        let mut response = (self.status, Json(body)).into_response();
        report.attach(&mut response);
        response
    }
}

#[cfg(test)]
mod tests {
    use crate::application::error::Backend;

    use super::*;

    #[test]
    fn transient_failures_hide_internal_text() {
        let api = ApiError::from_app(
            "test",
            AppError::transient(Backend::Cache, "connection refused at 10.0.0.7:6379"),
        );
        assert_eq!(api.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(api.code(), codes::SERVER_BUSY);
        assert!(api.hint.is_none());

        let response = api.into_response();
        let report = response
            .extensions()
            .get::<ErrorReport>()
            .expect("report attached");
        assert!(report.messages[0].contains("connection refused"));
    }

    #[test]
    fn conflicts_keep_a_stable_code() {
        let api = ApiError::from_app("test", AppError::Conflict(ConflictKind::RepeatedVote));
        assert_eq!(api.status(), StatusCode::CONFLICT);
        assert_eq!(api.code(), "conflict_repeated_vote");
    }
}
