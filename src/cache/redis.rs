//! Redis-backed cache store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Connection, Pool};
use redis::{AsyncCommands, ErrorKind, RedisError, Script};
use tracing::warn;

use crate::domain::entities::{CommunityRecord, CommunitySummary, PostRecord};
use crate::domain::types::{RankOrder, VoteValue};

use super::keys::CacheKey;
use super::store::{
    BallotTransition, CacheError, CacheLookup, CacheStore, FIELD_COMMUNITY_ID,
    FIELD_COMMUNITY_NAME, community_fields, community_from_fields, creation_score, parse_ballot,
    post_fields, post_from_fields,
};

/// Cache store speaking to Redis through a pooled connection.
///
/// Multi-key writes run as MULTI/EXEC batches so readers never observe half of an update.
#[derive(Clone)]
pub struct RedisCacheStore {
    pool: Pool,
}

impl RedisCacheStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn connection(&self) -> Result<Connection, CacheError> {
        self.pool.get().await.map_err(|err| {
            warn!(error = %err, "Failed to get Redis connection");
            CacheError::unavailable(err)
        })
    }
}

/// KEYS: ballots hash, global score set. ARGV: user id, new value, score per vote, post id.
///
/// Replies with the previous ballot as a string, or nil for a repeat. A stored ballot outside
/// -1..1 fails with WRONGTYPE so the caller reports the key as corrupt.
const TRANSITION_BALLOT: &str = r#"
local raw = redis.call('HGET', KEYS[1], ARGV[1])
local previous = 0
if raw then
  previous = tonumber(raw)
  if previous ~= -1 and previous ~= 0 and previous ~= 1 then
    return redis.error_reply('WRONGTYPE ballot value ' .. raw)
  end
end
local requested = tonumber(ARGV[2])
if previous == requested then
  return false
end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
redis.call('ZINCRBY', KEYS[2], (requested - previous) * tonumber(ARGV[3]), ARGV[4])
return tostring(previous)
"#;

fn redis_error(key: &str, err: RedisError) -> CacheError {
    if err.kind() == ErrorKind::TypeError || err.code() == Some("WRONGTYPE") {
        return CacheError::corrupt(key, err.to_string());
    }
    CacheError::unavailable(err)
}

fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs().max(1)).unwrap_or(i64::MAX)
}

#[async_trait]
impl CacheStore for RedisCacheStore {
    async fn community(&self, id: i64) -> Result<CacheLookup<CommunityRecord>, CacheError> {
        let key = CacheKey::Community(id).render();
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|err| redis_error(&key, err))?;
        if fields.is_empty() {
            return Ok(CacheLookup::NotFound);
        }
        community_from_fields(&key, &fields).map(CacheLookup::Found)
    }

    async fn put_community(&self, community: &CommunityRecord) -> Result<(), CacheError> {
        let hash_key = CacheKey::Community(community.id).render();
        let list_key = CacheKey::CommunityList.render();
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&hash_key, &community_fields(community))
            .ignore()
            .zadd(
                &list_key,
                community.id,
                community.created_at.unix_timestamp() as f64,
            )
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error(&hash_key, err))?;
        Ok(())
    }

    async fn backfill_community(&self, community: &CommunityRecord) -> Result<(), CacheError> {
        let key = CacheKey::Community(community.id).render();
        let mut conn = self.connection().await?;
        let _: () = conn
            .hset_multiple(&key, &community_fields(community))
            .await
            .map_err(|err| redis_error(&key, err))?;
        Ok(())
    }

    async fn community_list(&self) -> Result<CacheLookup<Vec<CommunitySummary>>, CacheError> {
        let list_key = CacheKey::CommunityList.render();
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn
            .zrange(&list_key, 0, -1)
            .await
            .map_err(|err| redis_error(&list_key, err))?;
        if members.is_empty() {
            return Ok(CacheLookup::NotFound);
        }

        let mut pipe = redis::pipe();
        for member in &members {
            match member.parse::<i64>() {
                Ok(id) => {
                    pipe.cmd("HMGET")
                        .arg(CacheKey::Community(id).render())
                        .arg(FIELD_COMMUNITY_ID)
                        .arg(FIELD_COMMUNITY_NAME);
                }
                Err(err) => {
                    warn!(member = %member, error = %err, "Skipping non-numeric community id");
                }
            }
        }
        let rows: Vec<(Option<String>, Option<String>)> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error(&list_key, err))?;

        let summaries = rows
            .into_iter()
            .filter_map(|row| match row {
                (Some(id), Some(name)) => id.parse().ok().map(|id| CommunitySummary { id, name }),
                _ => None,
            })
            .collect();
        Ok(CacheLookup::Found(summaries))
    }

    async fn post(&self, id: i64) -> Result<CacheLookup<PostRecord>, CacheError> {
        let key = CacheKey::Post(id).render();
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> = conn
            .hgetall(&key)
            .await
            .map_err(|err| redis_error(&key, err))?;
        if fields.is_empty() {
            return Ok(CacheLookup::NotFound);
        }
        post_from_fields(&key, &fields).map(CacheLookup::Found)
    }

    async fn put_fresh_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError> {
        let hash_key = CacheKey::Post(post.id).render();
        let time_key = CacheKey::PostRank(RankOrder::Time).render();
        let score_key = CacheKey::PostRank(RankOrder::Score).render();
        let members_key = CacheKey::CommunityPosts(post.community_id).render();
        let score = creation_score(post);
        let mut conn = self.connection().await?;

        // A post already in the time set was warmed before; its score set entry may carry votes.
        let known: Option<f64> = conn
            .zscore(&time_key, post.id)
            .await
            .map_err(|err| redis_error(&time_key, err))?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .hset_multiple(&hash_key, &post_fields(post))
            .ignore()
            .expire(&hash_key, ttl_seconds(ttl))
            .ignore()
            .sadd(&members_key, post.id)
            .ignore();
        if known.is_none() {
            pipe.zadd(&time_key, post.id, score)
                .ignore()
                .zincr(&score_key, post.id, score)
                .ignore();
        }
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error(&hash_key, err))?;
        Ok(())
    }

    async fn backfill_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError> {
        let key = CacheKey::Post(post.id).render();
        let mut conn = self.connection().await?;
        let _: () = redis::pipe()
            .atomic()
            .hset_multiple(&key, &post_fields(post))
            .ignore()
            .expire(&key, ttl_seconds(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error(&key, err))?;
        Ok(())
    }

    async fn ballot(&self, post_id: i64, user_id: i64) -> Result<VoteValue, CacheError> {
        let key = CacheKey::PostBallots(post_id).render();
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .hget(&key, user_id)
            .await
            .map_err(|err| redis_error(&key, err))?;
        match raw {
            Some(raw) => parse_ballot(&key, &raw),
            None => Ok(VoteValue::Neutral),
        }
    }

    async fn transition_ballot(
        &self,
        post_id: i64,
        user_id: i64,
        value: VoteValue,
        score_per_vote: f64,
    ) -> Result<Option<BallotTransition>, CacheError> {
        let ballots_key = CacheKey::PostBallots(post_id).render();
        let score_key = CacheKey::PostRank(RankOrder::Score).render();
        let mut conn = self.connection().await?;
        let previous: Option<String> = Script::new(TRANSITION_BALLOT)
            .key(&ballots_key)
            .key(&score_key)
            .arg(user_id)
            .arg(value.as_i8())
            .arg(score_per_vote)
            .arg(post_id)
            .invoke_async(&mut conn)
            .await
            .map_err(|err| redis_error(&ballots_key, err))?;
        match previous {
            Some(raw) => {
                let previous = parse_ballot(&ballots_key, &raw)?;
                Ok(BallotTransition::between(previous, value, score_per_vote))
            }
            None => Ok(None),
        }
    }

    async fn vote_count(&self, post_id: i64) -> Result<i64, CacheError> {
        let key = CacheKey::PostBallots(post_id).render();
        let mut conn = self.connection().await?;
        let values: Vec<String> = conn
            .hvals(&key)
            .await
            .map_err(|err| redis_error(&key, err))?;
        Ok(values
            .iter()
            .filter_map(|raw| raw.parse::<i64>().ok())
            .sum())
    }

    async fn rank_score(&self, order: RankOrder, post_id: i64) -> Result<Option<f64>, CacheError> {
        let key = CacheKey::PostRank(order).render();
        let mut conn = self.connection().await?;
        conn.zscore(&key, post_id)
            .await
            .map_err(|err| redis_error(&key, err))
    }

    async fn derive_community_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let derived_key = CacheKey::CommunityRank(community_id, order).render();
        let members_key = CacheKey::CommunityPosts(community_id).render();
        let global_key = CacheKey::PostRank(order).render();
        let mut conn = self.connection().await?;

        let exists: bool = conn
            .exists(&derived_key)
            .await
            .map_err(|err| redis_error(&derived_key, err))?;
        if exists {
            return Ok(false);
        }

        let _: () = redis::pipe()
            .atomic()
            .zinterstore_max(&derived_key, &[members_key.as_str(), global_key.as_str()])
            .ignore()
            .expire(&derived_key, ttl_seconds(ttl))
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|err| redis_error(&derived_key, err))?;
        Ok(true)
    }

    async fn community_reverse_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        post_id: i64,
    ) -> Result<Option<u64>, CacheError> {
        let key = CacheKey::CommunityRank(community_id, order).render();
        let mut conn = self.connection().await?;
        conn.zrevrank(&key, post_id)
            .await
            .map_err(|err| redis_error(&key, err))
    }

    async fn community_reverse_range(
        &self,
        community_id: i64,
        order: RankOrder,
        start: u64,
        count: u64,
    ) -> Result<Vec<i64>, CacheError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let key = CacheKey::CommunityRank(community_id, order).render();
        let start = isize::try_from(start).unwrap_or(isize::MAX);
        let stop = start.saturating_add(isize::try_from(count - 1).unwrap_or(isize::MAX));
        let mut conn = self.connection().await?;
        let members: Vec<String> = conn
            .zrevrange(&key, start, stop)
            .await
            .map_err(|err| redis_error(&key, err))?;
        Ok(members
            .into_iter()
            .filter_map(|member| match member.parse() {
                Ok(id) => Some(id),
                Err(err) => {
                    warn!(
                        key = %key,
                        member = %member,
                        error = %err,
                        "Skipping non-numeric post id"
                    );
                    None
                }
            })
            .collect())
    }

    async fn store_refresh_token(
        &self,
        user_id: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = CacheKey::RefreshToken(user_id).render();
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(&key, token, ttl.as_secs().max(1))
            .await
            .map_err(|err| redis_error(&key, err))?;
        Ok(())
    }

    async fn refresh_token(&self, user_id: i64) -> Result<CacheLookup<String>, CacheError> {
        let key = CacheKey::RefreshToken(user_id).render();
        let mut conn = self.connection().await?;
        let token: Option<String> = conn
            .get(&key)
            .await
            .map_err(|err| redis_error(&key, err))?;
        Ok(match token {
            Some(token) => CacheLookup::Found(token),
            None => CacheLookup::NotFound,
        })
    }
}
