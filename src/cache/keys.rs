//! Cache key definitions.
//!
//! Every key lives under the `lightning:` prefix. `CacheKey` renders to the exact string stored in
//! the cache backend and also serves as the coalescing key for reads of that resource.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::domain::types::RankOrder;

pub const KEY_PREFIX: &str = "lightning:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Per-user refresh token string.
    RefreshToken(i64),
    /// Community detail hash.
    Community(i64),
    /// Ranked set of community ids scored by creation time.
    CommunityList,
    /// Post detail hash.
    Post(i64),
    /// Global post rank set (by creation time or by vote score).
    PostRank(RankOrder),
    /// Unordered set of post ids belonging to a community.
    CommunityPosts(i64),
    /// Ballot map `user_id -> vote value` for one post.
    PostBallots(i64),
    /// Materialized intersection of a community's posts and a global rank set.
    CommunityRank(i64, RankOrder),
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::RefreshToken(user_id) => {
                write!(f, "{KEY_PREFIX}user:{user_id}:refresh_token")
            }
            CacheKey::Community(id) => write!(f, "{KEY_PREFIX}community:{id}"),
            CacheKey::CommunityList => write!(f, "{KEY_PREFIX}community:list"),
            CacheKey::Post(id) => write!(f, "{KEY_PREFIX}post:{id}"),
            CacheKey::PostRank(order) => write!(f, "{KEY_PREFIX}post:{}", order.as_str()),
            CacheKey::CommunityPosts(id) => write!(f, "{KEY_PREFIX}community:{id}:posts"),
            CacheKey::PostBallots(post_id) => write!(f, "{KEY_PREFIX}vote:post:{post_id}"),
            CacheKey::CommunityRank(id, order) => {
                write!(f, "{KEY_PREFIX}community:{id}:post:{}", order.as_str())
            }
        }
    }
}

impl CacheKey {
    pub fn render(&self) -> String {
        self.to_string()
    }
}

// ============================================================================
// Hash Utilities
// ============================================================================

/// Hash any hashable value with the process-local default hasher.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
