//! Route handlers for the `/api/v2` surface.

use axum::Json;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::StatusCode;
use axum::http::request::Parts;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::application::error::{AppError, ErrorReport};
use crate::application::posts::NewPost;
use crate::domain::types::{RankOrder, VoteValue};

use super::HttpState;
use super::error::ApiError;

const SOURCE: &str = "infra::http::handlers";
pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated caller, as forwarded by the authentication layer in front of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActingUser(pub i64);

impl<S> FromRequestParts<S> for ActingUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|id| *id > 0)
            .map(ActingUser)
            .ok_or_else(ApiError::unauthorized)
    }
}

/// Identifiers may arrive as JSON numbers or as strings, since 64-bit ids overflow JavaScript
/// numbers.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IdParam {
    Number(i64),
    Text(String),
}

impl IdParam {
    fn resolve(&self, field: &'static str) -> Result<i64, ApiError> {
        match self {
            IdParam::Number(id) => Ok(*id),
            IdParam::Text(raw) => parse_id(raw, field),
        }
    }
}

fn parse_id(raw: &str, field: &'static str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .map_err(|_| ApiError::bad_request("Invalid identifier", Some(format!("{field}: {raw}"))))
}

#[derive(Debug, Deserialize)]
pub struct CreateCommunityRequest {
    pub community_id: IdParam,
    pub name: String,
    #[serde(default)]
    pub introduction: String,
}

#[derive(Debug, Deserialize)]
pub struct CreatePostRequest {
    pub community_id: IdParam,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct PostListQuery {
    pub community_id: Option<String>,
    pub token: Option<String>,
    pub order: Option<String>,
    pub size: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub post_id: IdParam,
    pub direction: i8,
}

pub async fn list_communities(
    State(state): State<HttpState>,
) -> Result<impl IntoResponse, ApiError> {
    let communities = state
        .communities
        .community_list()
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok(Json(communities))
}

pub async fn get_community(
    State(state): State<HttpState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw, "community_id")?;
    let community = state
        .communities
        .community_detail(id)
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok(Json(community))
}

pub async fn create_community(
    State(state): State<HttpState>,
    ActingUser(_admin): ActingUser,
    Json(payload): Json<CreateCommunityRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let id = payload.community_id.resolve("community_id")?;
    let community = state
        .communities
        .create_community(id, &payload.name, &payload.introduction)
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok((StatusCode::CREATED, Json(community)))
}

pub async fn get_post(
    State(state): State<HttpState>,
    Path(raw): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_id(&raw, "post_id")?;
    let detail = state
        .posts
        .post_detail(id)
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok(Json(detail))
}

pub async fn create_post(
    State(state): State<HttpState>,
    ActingUser(author_id): ActingUser,
    Json(payload): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let community_id = payload.community_id.resolve("community_id")?;
    let post = state
        .posts
        .create_post(NewPost {
            author_id,
            community_id,
            title: payload.title,
            content: payload.content,
        })
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn list_posts(
    State(state): State<HttpState>,
    Query(query): Query<PostListQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let community_id = match query.community_id.as_deref() {
        Some(raw) => parse_id(raw, "community_id")?,
        None => return Err(ApiError::bad_request("community_id is required", None)),
    };
    let order = RankOrder::parse_lenient(query.order.as_deref());

    let page = state
        .posts
        .list_posts(community_id, order, query.token.as_deref(), query.size)
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok(Json(page))
}

pub async fn cast_vote(
    State(state): State<HttpState>,
    ActingUser(user_id): ActingUser,
    Json(payload): Json<VoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let post_id = payload.post_id.resolve("post_id")?;
    let value = VoteValue::try_from(payload.direction)
        .map_err(|err| ApiError::from_app(SOURCE, AppError::from(err)))?;

    let receipt = state
        .votes
        .cast(user_id, post_id, value)
        .await
        .map_err(|err| ApiError::from_app(SOURCE, err))?;
    Ok(Json(receipt))
}

pub async fn health(State(state): State<HttpState>) -> Response {
    match state.health.check().await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => {
            let mut response = StatusCode::SERVICE_UNAVAILABLE.into_response();
            ErrorReport::from_error(
                "infra::http::health",
                StatusCode::SERVICE_UNAVAILABLE,
                &err,
            )
            .attach(&mut response);
            response
        }
    }
}
