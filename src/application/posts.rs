//! Post creation, cache-aside detail reads and ranked listings.

use std::sync::Arc;

use futures::future::join_all;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::application::changes::ChangeFeed;
use crate::application::communities::CommunityService;
use crate::application::error::AppError;
use crate::application::ids::IdGenerator;
use crate::application::pagination::Paginator;
use crate::application::repos::{CreatePostParams, PostsRepo, UsersRepo};
use crate::cache::{
    CacheKey, CacheLookup, CachePolicy, CacheStore, ExistenceFilter, RequestCoalescer,
};
use crate::domain::entities::{PostDetail, PostRecord};
use crate::domain::types::RankOrder;
use crate::infra::telemetry::{
    METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_FILTER_REJECT_TOTAL,
};
use crate::ingest::ChangeEvent;

const SOURCE: &str = "application::posts";
const MAX_TITLE_CHARS: usize = 128;

/// Input for [`PostService::create_post`].
#[derive(Debug, Clone)]
pub struct NewPost {
    pub author_id: i64,
    pub community_id: i64,
    pub title: String,
    pub content: String,
}

/// A page of enriched posts.
///
/// `skipped` counts ids from the rank window whose detail could not be loaded; they are left out
/// of `items` rather than failing the page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PostPage {
    #[serde(rename = "posts")]
    pub items: Vec<PostDetail>,
    pub skipped: usize,
    #[serde(rename = "token", skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

pub struct PostService {
    posts: Arc<dyn PostsRepo>,
    users: Arc<dyn UsersRepo>,
    communities: Arc<CommunityService>,
    cache: Arc<dyn CacheStore>,
    filter: Arc<ExistenceFilter>,
    ids: Arc<dyn IdGenerator>,
    paginator: Paginator,
    policy: CachePolicy,
    flights: RequestCoalescer<PostRecord, AppError>,
    changes: Option<ChangeFeed>,
}

impl PostService {
    pub fn new(
        posts: Arc<dyn PostsRepo>,
        users: Arc<dyn UsersRepo>,
        communities: Arc<CommunityService>,
        cache: Arc<dyn CacheStore>,
        filter: Arc<ExistenceFilter>,
        ids: Arc<dyn IdGenerator>,
        policy: CachePolicy,
    ) -> Self {
        Self {
            posts,
            users,
            communities,
            paginator: Paginator::new(Arc::clone(&cache), policy),
            cache,
            filter,
            ids,
            policy,
            flights: RequestCoalescer::new("post_detail"),
            changes: None,
        }
    }

    /// Publish an insert event for every post created through this service.
    pub fn with_change_feed(mut self, changes: ChangeFeed) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn filter(&self) -> &Arc<ExistenceFilter> {
        &self.filter
    }

    pub async fn create_post(&self, input: NewPost) -> Result<PostRecord, AppError> {
        let title = input.title.trim();
        if title.is_empty() {
            return Err(AppError::validation("title must not be empty"));
        }
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(AppError::validation(format!(
                "title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }
        if input.content.trim().is_empty() {
            return Err(AppError::validation("content must not be empty"));
        }
        if !self.communities.community_exists(input.community_id).await? {
            return Err(AppError::not_found("community"));
        }

        let record = self
            .posts
            .create_post(CreatePostParams {
                id: self.ids.next_id(),
                author_id: input.author_id,
                community_id: input.community_id,
                title: title.to_string(),
                content: input.content,
            })
            .await?;

        self.filter.add(record.id);
        info!(
            target = SOURCE,
            post_id = record.id,
            author_id = record.author_id,
            community_id = record.community_id,
            "Created post"
        );
        if let Some(changes) = &self.changes
            && changes
                .publish(&ChangeEvent::post_inserted(&record))
                .await
                .is_err()
        {
            self.warm_created(&record).await;
        }
        Ok(record)
    }

    /// Rank a created post directly when its insert event could not be published.
    ///
    /// The row is already durable, so a failure here is logged rather than returned.
    async fn warm_created(&self, record: &PostRecord) {
        match self
            .cache
            .put_fresh_post(record, self.policy.fresh_entity_ttl)
            .await
        {
            Ok(()) => info!(
                target = SOURCE,
                post_id = record.id,
                "Warmed created post without a change event"
            ),
            Err(err) => error!(
                target = SOURCE,
                post_id = record.id,
                community_id = record.community_id,
                error = %err,
                "Created post is missing from the rank sets"
            ),
        }
    }

    /// The bare post, through the existence gate and the coalesced cache-aside read.
    pub async fn post(&self, id: i64) -> Result<PostRecord, AppError> {
        if !self.filter.might_exist(id) {
            counter!(METRIC_FILTER_REJECT_TOTAL, "kind" => "post").increment(1);
            debug!(target = SOURCE, post_id = id, "Existence filter rejected post");
            return Err(AppError::not_found("post"));
        }
        self.flights
            .run(CacheKey::Post(id), || self.load_post(id))
            .await
    }

    async fn load_post(&self, id: i64) -> Result<PostRecord, AppError> {
        match self.cache.post(id).await {
            Ok(CacheLookup::Found(record)) => {
                counter!(METRIC_CACHE_HIT_TOTAL, "resource" => "post").increment(1);
                Ok(record)
            }
            Ok(CacheLookup::NotFound) => {
                counter!(METRIC_CACHE_MISS_TOTAL, "resource" => "post").increment(1);
                debug!(target = SOURCE, post_id = id, "Post not cached");
                let Some(record) = self.posts.find_post(id).await? else {
                    debug!(target = SOURCE, post_id = id, "Post does not exist");
                    return Err(AppError::not_found("post"));
                };
                if let Err(err) = self
                    .cache
                    .backfill_post(&record, self.policy.backfill_entity_ttl)
                    .await
                {
                    warn!(
                        target = SOURCE,
                        post_id = id,
                        error = %err,
                        "Failed to backfill post"
                    );
                }
                Ok(record)
            }
            Err(err) => {
                error!(target = SOURCE, post_id = id, error = %err, "Post cache read failed");
                Err(err.into())
            }
        }
    }

    /// The post plus its community, author name and vote count.
    ///
    /// Only the post itself can fail the call; each enrichment falls back to an empty value.
    pub async fn post_detail(&self, id: i64) -> Result<PostDetail, AppError> {
        let post = self.post(id).await?;

        let community = match self.communities.community_detail(post.community_id).await {
            Ok(community) => Some(community),
            Err(err) => {
                warn!(
                    target = SOURCE,
                    post_id = id,
                    community_id = post.community_id,
                    error = %err,
                    "Failed to load community for post"
                );
                None
            }
        };

        let author_name = match self.users.find_username(post.author_id).await {
            Ok(name) => name,
            Err(err) => {
                warn!(
                    target = SOURCE,
                    post_id = id,
                    author_id = post.author_id,
                    error = %err,
                    "Failed to load author name"
                );
                None
            }
        };

        let vote_count = match self.cache.vote_count(id).await {
            Ok(count) => count,
            Err(err) => {
                warn!(target = SOURCE, post_id = id, error = %err, "Failed to load vote count");
                0
            }
        };

        Ok(PostDetail {
            post,
            author_name,
            vote_count,
            community,
        })
    }

    /// One page of a community's posts in rank order.
    pub async fn list_posts(
        &self,
        community_id: i64,
        order: RankOrder,
        token: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<PostPage, AppError> {
        let window = self
            .paginator
            .window(community_id, order, token, page_size)
            .await?;

        let details = join_all(window.post_ids.iter().map(|id| self.post_detail(*id))).await;
        let mut items = Vec::with_capacity(details.len());
        let mut skipped = 0;
        for (id, detail) in window.post_ids.iter().zip(details) {
            match detail {
                Ok(detail) => items.push(detail),
                Err(err) => {
                    warn!(
                        target = SOURCE,
                        post_id = *id,
                        community_id,
                        error = %err,
                        "Skipping post that could not be loaded"
                    );
                    skipped += 1;
                }
            }
        }

        Ok(PostPage {
            items,
            skipped,
            next_cursor: window.next_cursor,
        })
    }
}
