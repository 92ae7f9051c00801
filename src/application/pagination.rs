//! Opaque, expiring page cursors for ranked post listings.
//!
//! Wire format: standard base64 of the JSON object `{next_id, next_time_at_utc, page_size}`.
//! `next_id` travels as a string and `next_time_at_utc` is the expiry in unix seconds.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, error};

use crate::application::error::AppError;
use crate::cache::{CachePolicy, CacheStore};
use crate::domain::types::RankOrder;

const SOURCE: &str = "application::pagination";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    #[serde(default)]
    pub next_id: String,
    #[serde(default)]
    pub next_time_at_utc: i64,
    #[serde(default)]
    pub page_size: i64,
}

impl PageCursor {
    pub fn new(next_id: i64, expires_at: OffsetDateTime, page_size: u32) -> Self {
        Self {
            next_id: next_id.to_string(),
            next_time_at_utc: expires_at.unix_timestamp(),
            page_size: i64::from(page_size),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_vec(self)
            .map(|bytes| STANDARD.encode(bytes))
            .unwrap_or_default()
    }

    /// Decode a token, yielding the zero cursor for anything that is not base64-encoded JSON of
    /// the right shape. Callers check [`PageCursor::is_valid_at`] afterwards.
    pub fn decode(token: &str) -> Self {
        if token.is_empty() {
            return Self::default();
        }
        STANDARD
            .decode(token)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        !self.next_id.is_empty()
            && self.next_time_at_utc >= now.unix_timestamp()
            && self.page_size > 0
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(OffsetDateTime::now_utc())
    }

    /// The post id the next page starts at, when it is numeric.
    pub fn next_post_id(&self) -> Option<i64> {
        self.next_id.parse().ok()
    }

    pub fn page_size(&self) -> u32 {
        u32::try_from(self.page_size).unwrap_or(u32::MAX)
    }
}

/// One page of post ids from a community rank set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankWindow {
    pub post_ids: Vec<i64>,
    pub next_cursor: Option<String>,
}

/// Cursor-driven windows over per-community rank sets.
///
/// The per-community set is the intersection of the community's membership set with the global
/// rank set for the order, materialized with a short TTL and reused until it expires.
pub struct Paginator {
    cache: Arc<dyn CacheStore>,
    policy: CachePolicy,
}

impl Paginator {
    pub fn new(cache: Arc<dyn CacheStore>, policy: CachePolicy) -> Self {
        Self { cache, policy }
    }

    /// Resolve the page that `token` points at, or the first page when no token is given.
    ///
    /// `page_size` only applies to first pages; a cursor carries its own size.
    pub async fn window(
        &self,
        community_id: i64,
        order: RankOrder,
        token: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<RankWindow, AppError> {
        let (page_size, start_at) = match token.filter(|token| !token.is_empty()) {
            Some(token) => {
                let cursor = PageCursor::decode(token);
                if !cursor.is_valid() {
                    debug!(target = SOURCE, community_id, "Rejected invalid page cursor");
                    return Err(AppError::InvalidCursor);
                }
                (
                    self.policy.page_size(Some(cursor.page_size())),
                    cursor.next_post_id(),
                )
            }
            None => (self.policy.page_size(page_size), None),
        };

        let derived = self
            .cache
            .derive_community_rank(community_id, order, self.policy.community_ranking_ttl)
            .await
            .map_err(|err| {
                error!(
                    target = SOURCE,
                    community_id,
                    order = order.as_str(),
                    error = %err,
                    "Failed to derive community rank set"
                );
                AppError::from(err)
            })?;
        if derived {
            debug!(
                target = SOURCE,
                community_id,
                order = order.as_str(),
                "Derived community rank set"
            );
        }

        let start = match start_at {
            Some(post_id) => self
                .cache
                .community_reverse_rank(community_id, order, post_id)
                .await?
                .unwrap_or_else(|| {
                    debug!(
                        target = SOURCE,
                        community_id,
                        post_id,
                        "Cursor post left the rank set, restarting from the top"
                    );
                    0
                }),
            None => 0,
        };

        let mut post_ids = self
            .cache
            .community_reverse_range(community_id, order, start, u64::from(page_size) + 1)
            .await?;

        let page_len = page_size as usize;
        let next_cursor = if post_ids.len() > page_len {
            let next_id = post_ids[page_len];
            post_ids.truncate(page_len);
            let expires_at = OffsetDateTime::now_utc() + self.policy.page_cursor_lifetime;
            Some(PageCursor::new(next_id, expires_at, page_size).encode())
        } else {
            None
        };

        Ok(RankWindow {
            post_ids,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use time::Duration;

    use crate::cache::MemoryCacheStore;
    use crate::domain::entities::PostRecord;

    use super::*;

    #[test]
    fn cursor_round_trips_through_token() {
        let expires = OffsetDateTime::now_utc() + Duration::hours(4);
        let cursor = PageCursor::new(1_234_567_890_123, expires, 2);

        let decoded = PageCursor::decode(&cursor.encode());
        assert_eq!(decoded, cursor);
        assert!(decoded.is_valid());
        assert_eq!(decoded.next_post_id(), Some(1_234_567_890_123));
    }

    #[test]
    fn wire_format_is_base64_json() {
        let cursor = PageCursor {
            next_id: "7".to_string(),
            next_time_at_utc: 100,
            page_size: 2,
        };
        let bytes = STANDARD.decode(cursor.encode()).expect("base64");
        let json: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(
            json,
            serde_json::json!({"next_id": "7", "next_time_at_utc": 100, "page_size": 2})
        );
    }

    #[test]
    fn garbage_tokens_decode_to_zero_cursor() {
        assert_eq!(PageCursor::decode("%%%not-base64"), PageCursor::default());
        assert_eq!(PageCursor::decode(""), PageCursor::default());

        let token = PageCursor::new(9, OffsetDateTime::now_utc(), 2).encode();
        let truncated = &token[..token.len() / 2];
        assert_eq!(PageCursor::decode(truncated), PageCursor::default());

        let not_a_cursor = STANDARD.encode(br#"{"next_id": 5}"#);
        assert_eq!(PageCursor::decode(&not_a_cursor), PageCursor::default());
    }

    #[test]
    fn zero_cursor_is_invalid() {
        assert!(!PageCursor::default().is_valid());
    }

    fn post(id: i64, community_id: i64, created_unix: i64) -> PostRecord {
        PostRecord {
            id,
            author_id: 1,
            community_id,
            title: format!("post {id}"),
            content: String::new(),
            created_at: OffsetDateTime::from_unix_timestamp(created_unix).expect("timestamp"),
        }
    }

    async fn seeded(posts: &[PostRecord]) -> Arc<MemoryCacheStore> {
        let cache = Arc::new(MemoryCacheStore::new());
        for post in posts {
            cache
                .put_fresh_post(post, StdDuration::from_secs(3600))
                .await
                .expect("warm");
        }
        cache
    }

    #[tokio::test]
    async fn walks_a_community_page_by_page() {
        let cache = seeded(&[post(1, 5, 1), post(2, 5, 2)]).await;
        let paginator = Paginator::new(cache, CachePolicy::default());

        let first = paginator
            .window(5, RankOrder::Time, None, Some(1))
            .await
            .expect("first page");
        assert_eq!(first.post_ids, vec![2]);
        let token = first.next_cursor.expect("cursor");
        let cursor = PageCursor::decode(&token);
        assert_eq!(cursor.next_id, "1");
        assert_eq!(cursor.page_size, 1);

        let second = paginator
            .window(5, RankOrder::Time, Some(&token), None)
            .await
            .expect("second page");
        assert_eq!(second.post_ids, vec![1]);
        assert_eq!(second.next_cursor, None);
    }

    #[tokio::test]
    async fn other_communities_are_excluded() {
        let cache = seeded(&[post(1, 5, 1), post(2, 6, 2), post(3, 5, 3)]).await;
        let paginator = Paginator::new(cache, CachePolicy::default());
        let window = paginator
            .window(5, RankOrder::Score, None, Some(10))
            .await
            .expect("page");
        assert_eq!(window.post_ids, vec![3, 1]);
        assert_eq!(window.next_cursor, None);
    }

    #[tokio::test]
    async fn invalid_token_is_rejected_but_unknown_post_restarts() {
        let cache = seeded(&[post(1, 5, 1), post(2, 5, 2)]).await;
        let paginator = Paginator::new(cache, CachePolicy::default());

        let err = paginator
            .window(5, RankOrder::Time, Some("garbage"), None)
            .await
            .expect_err("invalid");
        assert_eq!(err, AppError::InvalidCursor);

        let stale = PageCursor::new(999, OffsetDateTime::now_utc() + Duration::hours(1), 2);
        let window = paginator
            .window(5, RankOrder::Time, Some(&stale.encode()), None)
            .await
            .expect("restart");
        assert_eq!(window.post_ids, vec![2, 1]);
    }

    #[test]
    fn expired_or_empty_cursors_are_invalid() {
        let now = OffsetDateTime::now_utc();
        let expired = PageCursor::new(1, now - Duration::seconds(1), 2);
        assert!(!expired.is_valid_at(now));

        let no_size = PageCursor::new(1, now + Duration::hours(1), 0);
        assert!(!no_size.is_valid_at(now));

        let mut no_id = PageCursor::new(1, now + Duration::hours(1), 2);
        no_id.next_id.clear();
        assert!(!no_id.is_valid_at(now));
    }
}
