//! In-process cache backend.
//!
//! Mirrors the Redis data model (strings, hashes, sets and sorted sets with per-key expiry) behind
//! a single mutex, so multi-key writes are atomic exactly like a MULTI/EXEC batch. Expiry uses the
//! tokio clock, which lets tests drive TTLs with `tokio::time::pause`.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::domain::entities::{CommunityRecord, CommunitySummary, PostRecord};
use crate::domain::types::{RankOrder, VoteValue};
use crate::util::lock::mutex_lock;

use super::keys::CacheKey;
use super::store::{
    BallotTransition, CacheError, CacheLookup, CacheStore, FIELD_COMMUNITY_ID,
    FIELD_COMMUNITY_NAME, community_fields, community_from_fields, creation_score, parse_ballot,
    post_fields, post_from_fields,
};

const SOURCE: &str = "cache::memory";

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
    Ranked(HashMap<String, f64>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
}

impl Keyspace {
    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = self
            .entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|deadline| deadline <= Instant::now());
        if expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }

    fn exists(&mut self, key: &str) -> bool {
        self.live(key).is_some()
    }

    fn expire(&mut self, key: &str, ttl: Duration) {
        if let Some(entry) = self.live(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }

    fn hash(&mut self, key: &str) -> Result<Option<&HashMap<String, String>>, CacheError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(Some(&*fields)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn hash_mut(&mut self, key: &str) -> Result<&mut HashMap<String, String>, CacheError> {
        if !self.exists(key) {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields),
            _ => Err(wrong_type(key)),
        }
    }

    fn set_mut(&mut self, key: &str) -> Result<&mut HashSet<String>, CacheError> {
        if !self.exists(key) {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Set(HashSet::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    fn ranked(&mut self, key: &str) -> Result<Option<&HashMap<String, f64>>, CacheError> {
        match self.live(key) {
            None => Ok(None),
            Some(Entry {
                value: Value::Ranked(members),
                ..
            }) => Ok(Some(&*members)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    fn ranked_mut(&mut self, key: &str) -> Result<&mut HashMap<String, f64>, CacheError> {
        if !self.exists(key) {
            self.entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Ranked(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match self.entries.get_mut(key) {
            Some(Entry {
                value: Value::Ranked(members),
                ..
            }) => Ok(members),
            _ => Err(wrong_type(key)),
        }
    }

    /// Members ordered highest score first, ties broken by member descending.
    fn reverse_ordered(&mut self, key: &str) -> Result<Vec<String>, CacheError> {
        let Some(members) = self.ranked(key)? else {
            return Ok(Vec::new());
        };
        let mut ordered: Vec<(&String, f64)> = members.iter().map(|(m, s)| (m, *s)).collect();
        ordered.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| b.0.cmp(a.0)));
        Ok(ordered.into_iter().map(|(member, _)| member.clone()).collect())
    }

    fn write_hash(
        &mut self,
        key: &str,
        fields: Vec<(&'static str, String)>,
    ) -> Result<(), CacheError> {
        let hash = self.hash_mut(key)?;
        for (name, value) in fields {
            hash.insert(name.to_string(), value);
        }
        Ok(())
    }
}

fn wrong_type(key: &str) -> CacheError {
    CacheError::corrupt(key, "operation against a key holding the wrong kind of value")
}

/// Cache backend that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryCacheStore {
    keyspace: Mutex<Keyspace>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys, after purging expired ones.
    pub fn len(&self) -> usize {
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "len");
        let keys: Vec<String> = keyspace.entries.keys().cloned().collect();
        keys.iter().filter(|key| keyspace.exists(key)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains_key(&self, key: &CacheKey) -> bool {
        mutex_lock(&self.keyspace, SOURCE, "contains_key").exists(&key.render())
    }

    pub fn clear(&self) {
        mutex_lock(&self.keyspace, SOURCE, "clear").entries.clear();
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn community(&self, id: i64) -> Result<CacheLookup<CommunityRecord>, CacheError> {
        let key = CacheKey::Community(id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "community");
        match keyspace.hash(&key)? {
            Some(fields) if !fields.is_empty() => {
                community_from_fields(&key, fields).map(CacheLookup::Found)
            }
            _ => Ok(CacheLookup::NotFound),
        }
    }

    async fn put_community(&self, community: &CommunityRecord) -> Result<(), CacheError> {
        let hash_key = CacheKey::Community(community.id).render();
        let list_key = CacheKey::CommunityList.render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "put_community");
        // Validate both targets before mutating either one.
        keyspace.hash_mut(&hash_key)?;
        keyspace.ranked_mut(&list_key)?;
        keyspace.write_hash(&hash_key, community_fields(community))?;
        keyspace.ranked_mut(&list_key)?.insert(
            community.id.to_string(),
            community.created_at.unix_timestamp() as f64,
        );
        Ok(())
    }

    async fn backfill_community(&self, community: &CommunityRecord) -> Result<(), CacheError> {
        let key = CacheKey::Community(community.id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "backfill_community");
        keyspace.write_hash(&key, community_fields(community))
    }

    async fn community_list(&self) -> Result<CacheLookup<Vec<CommunitySummary>>, CacheError> {
        let list_key = CacheKey::CommunityList.render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "community_list");
        let mut ids: Vec<(String, f64)> = match keyspace.ranked(&list_key)? {
            Some(members) => members.iter().map(|(m, s)| (m.clone(), *s)).collect(),
            None => Vec::new(),
        };
        if ids.is_empty() {
            return Ok(CacheLookup::NotFound);
        }
        ids.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let mut summaries = Vec::with_capacity(ids.len());
        for (member, _) in ids {
            let Ok(id) = member.parse::<i64>() else {
                continue;
            };
            let hash_key = CacheKey::Community(id).render();
            let Some(fields) = keyspace.hash(&hash_key)? else {
                continue;
            };
            let (Some(raw_id), Some(name)) = (
                fields.get(FIELD_COMMUNITY_ID),
                fields.get(FIELD_COMMUNITY_NAME),
            ) else {
                continue;
            };
            if let Ok(id) = raw_id.parse::<i64>() {
                summaries.push(CommunitySummary {
                    id,
                    name: name.clone(),
                });
            }
        }
        Ok(CacheLookup::Found(summaries))
    }

    async fn post(&self, id: i64) -> Result<CacheLookup<PostRecord>, CacheError> {
        let key = CacheKey::Post(id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "post");
        match keyspace.hash(&key)? {
            Some(fields) if !fields.is_empty() => {
                post_from_fields(&key, fields).map(CacheLookup::Found)
            }
            _ => Ok(CacheLookup::NotFound),
        }
    }

    async fn put_fresh_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError> {
        let hash_key = CacheKey::Post(post.id).render();
        let time_key = CacheKey::PostRank(RankOrder::Time).render();
        let score_key = CacheKey::PostRank(RankOrder::Score).render();
        let members_key = CacheKey::CommunityPosts(post.community_id).render();
        let member = post.id.to_string();
        let score = creation_score(post);

        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "put_fresh_post");
        keyspace.hash_mut(&hash_key)?;
        keyspace.ranked_mut(&time_key)?;
        keyspace.ranked_mut(&score_key)?;
        keyspace.set_mut(&members_key)?;

        keyspace.write_hash(&hash_key, post_fields(post))?;
        keyspace.expire(&hash_key, ttl);
        // Redelivery keeps whatever votes already moved the score.
        let first_warm = !keyspace.ranked_mut(&time_key)?.contains_key(&member);
        if first_warm {
            keyspace.ranked_mut(&time_key)?.insert(member.clone(), score);
            *keyspace
                .ranked_mut(&score_key)?
                .entry(member.clone())
                .or_insert(0.0) += score;
        }
        keyspace.set_mut(&members_key)?.insert(member);
        Ok(())
    }

    async fn backfill_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError> {
        let key = CacheKey::Post(post.id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "backfill_post");
        keyspace.write_hash(&key, post_fields(post))?;
        keyspace.expire(&key, ttl);
        Ok(())
    }

    async fn ballot(&self, post_id: i64, user_id: i64) -> Result<VoteValue, CacheError> {
        let key = CacheKey::PostBallots(post_id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "ballot");
        match keyspace
            .hash(&key)?
            .and_then(|ballots| ballots.get(&user_id.to_string()))
        {
            Some(raw) => parse_ballot(&key, raw),
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
        let member = user_id.to_string();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "transition_ballot");
        keyspace.ranked_mut(&score_key)?;

        let previous = match keyspace
            .hash(&ballots_key)?
            .and_then(|ballots| ballots.get(&member))
        {
            Some(raw) => parse_ballot(&ballots_key, raw)?,
            None => VoteValue::Neutral,
        };
        let Some(transition) = BallotTransition::between(previous, value, score_per_vote) else {
            return Ok(None);
        };

        keyspace
            .hash_mut(&ballots_key)?
            .insert(member, value.to_string());
        *keyspace
            .ranked_mut(&score_key)?
            .entry(post_id.to_string())
            .or_insert(0.0) += transition.score_delta;
        Ok(Some(transition))
    }

    async fn vote_count(&self, post_id: i64) -> Result<i64, CacheError> {
        let key = CacheKey::PostBallots(post_id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "vote_count");
        let Some(ballots) = keyspace.hash(&key)? else {
            return Ok(0);
        };
        Ok(ballots
            .values()
            .filter_map(|raw| raw.parse::<i64>().ok())
            .sum())
    }

    async fn rank_score(&self, order: RankOrder, post_id: i64) -> Result<Option<f64>, CacheError> {
        let key = CacheKey::PostRank(order).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "rank_score");
        Ok(keyspace
            .ranked(&key)?
            .and_then(|members| members.get(&post_id.to_string()).copied()))
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
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "derive_community_rank");
        if keyspace.exists(&derived_key) {
            return Ok(false);
        }

        let members: HashSet<String> = match keyspace.live(&members_key) {
            None => HashSet::new(),
            Some(Entry {
                value: Value::Set(members),
                ..
            }) => members.clone(),
            Some(_) => return Err(wrong_type(&members_key)),
        };
        let global = keyspace.ranked(&global_key)?.cloned().unwrap_or_default();

        // Plain set members weigh 1, so MAX keeps the rank score for any real timestamp.
        let derived: HashMap<String, f64> = members
            .into_iter()
            .filter_map(|member| {
                global
                    .get(&member)
                    .map(|score| (member.clone(), score.max(1.0)))
            })
            .collect();

        if derived.is_empty() {
            keyspace.entries.remove(&derived_key);
            return Ok(true);
        }
        keyspace.entries.insert(
            derived_key,
            Entry {
                value: Value::Ranked(derived),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn community_reverse_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        post_id: i64,
    ) -> Result<Option<u64>, CacheError> {
        let key = CacheKey::CommunityRank(community_id, order).render();
        let member = post_id.to_string();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "community_reverse_rank");
        Ok(keyspace
            .reverse_ordered(&key)?
            .iter()
            .position(|candidate| *candidate == member)
            .map(|position| position as u64))
    }

    async fn community_reverse_range(
        &self,
        community_id: i64,
        order: RankOrder,
        start: u64,
        count: u64,
    ) -> Result<Vec<i64>, CacheError> {
        let key = CacheKey::CommunityRank(community_id, order).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "community_reverse_range");
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        let count = usize::try_from(count).unwrap_or(usize::MAX);
        Ok(keyspace
            .reverse_ordered(&key)?
            .into_iter()
            .skip(start)
            .take(count)
            .filter_map(|member| member.parse().ok())
            .collect())
    }

    async fn store_refresh_token(
        &self,
        user_id: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let key = CacheKey::RefreshToken(user_id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "store_refresh_token");
        keyspace.entries.insert(
            key,
            Entry {
                value: Value::Text(token.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn refresh_token(&self, user_id: i64) -> Result<CacheLookup<String>, CacheError> {
        let key = CacheKey::RefreshToken(user_id).render();
        let mut keyspace = mutex_lock(&self.keyspace, SOURCE, "refresh_token");
        match keyspace.live(&key) {
            None => Ok(CacheLookup::NotFound),
            Some(Entry {
                value: Value::Text(token),
                ..
            }) => Ok(CacheLookup::Found(token.clone())),
            Some(_) => Err(wrong_type(&key)),
        }
    }
}
