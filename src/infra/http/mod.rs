mod error;
mod handlers;
mod middleware;

pub use error::{ApiError, ApiErrorBody, ApiErrorMessage, codes};
pub use handlers::{ActingUser, USER_ID_HEADER};
pub use middleware::{REQUEST_ID_HEADER, RequestContext};

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::communities::CommunityService;
use crate::application::posts::PostService;
use crate::application::votes::VoteLedger;
use crate::infra::error::InfraError;

/// Readiness check behind `GET /api/v2/health`.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self) -> Result<(), InfraError>;
}

#[derive(Clone)]
pub struct HttpState {
    pub communities: Arc<CommunityService>,
    pub posts: Arc<PostService>,
    pub votes: Arc<VoteLedger>,
    pub health: Arc<dyn HealthCheck>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route(
            "/api/v2/community",
            get(handlers::list_communities).post(handlers::create_community),
        )
        .route("/api/v2/community/{id}", get(handlers::get_community))
        .route("/api/v2/post", post(handlers::create_post))
        .route("/api/v2/post/{id}", get(handlers::get_post))
        .route("/api/v2/posts", get(handlers::list_posts))
        .route("/api/v2/vote", post(handlers::cast_vote))
        .route("/api/v2/health", get(handlers::health))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
