//! Shared fakes for integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use lightning::application::communities::CommunityService;
use lightning::application::ids::IdGenerator;
use lightning::application::posts::PostService;
use lightning::application::repos::{
    BallotWrite, CommunitiesRepo, CreateCommunityParams, CreatePostParams, PostsRepo, RepoError,
    UsersRepo, VotesRepo,
};
use lightning::application::votes::VoteLedger;
use lightning::cache::{
    BallotTransition, CacheError, CacheLookup, CachePolicy, CacheStore, ExistenceFilter,
    FilterSizing, MemoryCacheStore,
};
use lightning::domain::entities::{CommunityRecord, CommunitySummary, PostRecord, VoteBallot};
use lightning::domain::types::{RankOrder, VoteValue};
use lightning::ingest::MemoryEventLog;
use time::OffsetDateTime;
use time::macros::datetime;

pub const VOTE_STREAM: &str = "test:vote";
pub const COMMUNITY_STREAM: &str = "test:community";
pub const POST_STREAM: &str = "test:post";

pub fn community(id: i64, name: &str) -> CommunityRecord {
    CommunityRecord {
        id,
        name: name.to_string(),
        introduction: format!("all about {name}"),
        created_at: datetime!(2024-03-01 08:00 UTC) + time::Duration::minutes(id),
    }
}

pub fn post(id: i64, community_id: i64, created_at: OffsetDateTime) -> PostRecord {
    PostRecord {
        id,
        author_id: 7,
        community_id,
        title: format!("post {id}"),
        content: format!("body of post {id}"),
        created_at,
    }
}

pub fn small_filter() -> FilterSizing {
    FilterSizing {
        expected_items: 10_000,
        false_positive_rate: 0.01,
        hash_rounds: 5,
    }
}

/// In-memory authoritative store with call counters and fault injection.
#[derive(Default)]
pub struct MemoryRepos {
    communities: Mutex<HashMap<i64, CommunityRecord>>,
    posts: Mutex<HashMap<i64, PostRecord>>,
    users: Mutex<HashMap<i64, String>>,
    ballots: Mutex<HashMap<(i64, i64), VoteBallot>>,
    pub find_post_calls: AtomicUsize,
    pub find_community_calls: AtomicUsize,
    pub list_communities_calls: AtomicUsize,
    pub upsert_calls: AtomicUsize,
    /// Number of upcoming `upsert_ballot` calls that fail with a timeout.
    pub failing_upserts: AtomicUsize,
    /// Number of upcoming `upsert_ballot` calls rejected as a foreign-key violation.
    pub rejecting_upserts: AtomicUsize,
    read_delay: Mutex<Option<Duration>>,
}

impl MemoryRepos {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every read sleep for `delay` before answering.
    pub fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().expect("delay lock") = Some(delay);
    }

    pub fn insert_community(&self, record: CommunityRecord) {
        self.communities
            .lock()
            .expect("communities lock")
            .insert(record.id, record);
    }

    pub fn insert_post(&self, record: PostRecord) {
        self.posts.lock().expect("posts lock").insert(record.id, record);
    }

    pub fn insert_user(&self, id: i64, name: &str) {
        self.users
            .lock()
            .expect("users lock")
            .insert(id, name.to_string());
    }

    pub fn ballot_rows(&self) -> Vec<VoteBallot> {
        let mut rows: Vec<VoteBallot> = self
            .ballots
            .lock()
            .expect("ballots lock")
            .values()
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.post_id, row.user_id));
        rows
    }

    async fn pause(&self) {
        let delay = *self.read_delay.lock().expect("delay lock");
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl CommunitiesRepo for MemoryRepos {
    async fn community_exists(&self, id: i64) -> Result<bool, RepoError> {
        Ok(self.communities.lock().expect("lock").contains_key(&id))
    }

    async fn find_community(&self, id: i64) -> Result<Option<CommunityRecord>, RepoError> {
        self.find_community_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.communities.lock().expect("lock").get(&id).cloned())
    }

    async fn list_communities(&self) -> Result<Vec<CommunityRecord>, RepoError> {
        self.list_communities_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let mut all: Vec<CommunityRecord> =
            self.communities.lock().expect("lock").values().cloned().collect();
        all.sort_by_key(|record| (record.created_at, record.id));
        Ok(all)
    }

    async fn list_community_ids(&self) -> Result<Vec<i64>, RepoError> {
        Ok(self.communities.lock().expect("lock").keys().copied().collect())
    }

    async fn create_community(
        &self,
        params: CreateCommunityParams,
    ) -> Result<CommunityRecord, RepoError> {
        let mut communities = self.communities.lock().expect("lock");
        if communities.contains_key(&params.id) {
            return Err(RepoError::Duplicate {
                constraint: "communities_pkey".to_string(),
            });
        }
        let record = CommunityRecord {
            id: params.id,
            name: params.name,
            introduction: params.introduction,
            created_at: OffsetDateTime::now_utc(),
        };
        communities.insert(record.id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl PostsRepo for MemoryRepos {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError> {
        self.find_post_calls.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        Ok(self.posts.lock().expect("lock").get(&id).cloned())
    }

    async fn list_post_ids(&self) -> Result<Vec<i64>, RepoError> {
        Ok(self.posts.lock().expect("lock").keys().copied().collect())
    }

    async fn create_post(&self, params: CreatePostParams) -> Result<PostRecord, RepoError> {
        let record = PostRecord {
            id: params.id,
            author_id: params.author_id,
            community_id: params.community_id,
            title: params.title,
            content: params.content,
            created_at: OffsetDateTime::now_utc(),
        };
        self.posts
            .lock()
            .expect("lock")
            .insert(record.id, record.clone());
        Ok(record)
    }
}

#[async_trait]
impl UsersRepo for MemoryRepos {
    async fn find_username(&self, user_id: i64) -> Result<Option<String>, RepoError> {
        Ok(self.users.lock().expect("lock").get(&user_id).cloned())
    }
}

#[async_trait]
impl VotesRepo for MemoryRepos {
    async fn upsert_ballot(&self, ballot: &VoteBallot) -> Result<BallotWrite, RepoError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_upserts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_upserts.store(failing - 1, Ordering::SeqCst);
            return Err(RepoError::Timeout);
        }
        let rejecting = self.rejecting_upserts.load(Ordering::SeqCst);
        if rejecting > 0 {
            self.rejecting_upserts.store(rejecting - 1, Ordering::SeqCst);
            return Err(RepoError::InvalidInput {
                message: "post_votes_post_id_fkey".to_string(),
            });
        }
        let mut ballots = self.ballots.lock().expect("lock");
        let key = (ballot.post_id, ballot.user_id);
        match ballots.get_mut(&key) {
            Some(existing) => {
                existing.value = ballot.value;
                Ok(BallotWrite::Updated)
            }
            None => {
                ballots.insert(key, ballot.clone());
                Ok(BallotWrite::Inserted)
            }
        }
    }

    async fn find_ballot(
        &self,
        post_id: i64,
        user_id: i64,
    ) -> Result<Option<VoteBallot>, RepoError> {
        Ok(self
            .ballots
            .lock()
            .expect("lock")
            .get(&(post_id, user_id))
            .cloned())
    }
}

/// Memory cache that can be switched into a failing state.
#[derive(Default)]
pub struct SwitchableCache {
    pub inner: MemoryCacheStore,
    down: AtomicBool,
    latency_ms: AtomicU64,
}

impl SwitchableCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Delay every call by `latency`, the way a network round-trip suspends the caller.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    async fn check(&self) -> Result<(), CacheError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.down.load(Ordering::SeqCst) {
            Err(CacheError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl CacheStore for SwitchableCache {
    async fn community(&self, id: i64) -> Result<CacheLookup<CommunityRecord>, CacheError> {
        self.check().await?;
        self.inner.community(id).await
    }

    async fn put_community(&self, community: &CommunityRecord) -> Result<(), CacheError> {
        self.check().await?;
        self.inner.put_community(community).await
    }

    async fn backfill_community(&self, community: &CommunityRecord) -> Result<(), CacheError> {
        self.check().await?;
        self.inner.backfill_community(community).await
    }

    async fn community_list(&self) -> Result<CacheLookup<Vec<CommunitySummary>>, CacheError> {
        self.check().await?;
        self.inner.community_list().await
    }

    async fn post(&self, id: i64) -> Result<CacheLookup<PostRecord>, CacheError> {
        self.check().await?;
        self.inner.post(id).await
    }

    async fn put_fresh_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError> {
        self.check().await?;
        self.inner.put_fresh_post(post, ttl).await
    }

    async fn backfill_post(&self, post: &PostRecord, ttl: Duration) -> Result<(), CacheError> {
        self.check().await?;
        self.inner.backfill_post(post, ttl).await
    }

    async fn ballot(&self, post_id: i64, user_id: i64) -> Result<VoteValue, CacheError> {
        self.check().await?;
        self.inner.ballot(post_id, user_id).await
    }

    async fn transition_ballot(
        &self,
        post_id: i64,
        user_id: i64,
        value: VoteValue,
        score_per_vote: f64,
    ) -> Result<Option<BallotTransition>, CacheError> {
        self.check().await?;
        self.inner
            .transition_ballot(post_id, user_id, value, score_per_vote)
            .await
    }

    async fn vote_count(&self, post_id: i64) -> Result<i64, CacheError> {
        self.check().await?;
        self.inner.vote_count(post_id).await
    }

    async fn rank_score(&self, order: RankOrder, post_id: i64) -> Result<Option<f64>, CacheError> {
        self.check().await?;
        self.inner.rank_score(order, post_id).await
    }

    async fn derive_community_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        self.check().await?;
        self.inner
            .derive_community_rank(community_id, order, ttl)
            .await
    }

    async fn community_reverse_rank(
        &self,
        community_id: i64,
        order: RankOrder,
        post_id: i64,
    ) -> Result<Option<u64>, CacheError> {
        self.check().await?;
        self.inner
            .community_reverse_rank(community_id, order, post_id)
            .await
    }

    async fn community_reverse_range(
        &self,
        community_id: i64,
        order: RankOrder,
        start: u64,
        count: u64,
    ) -> Result<Vec<i64>, CacheError> {
        self.check().await?;
        self.inner
            .community_reverse_range(community_id, order, start, count)
            .await
    }

    async fn store_refresh_token(
        &self,
        user_id: i64,
        token: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        self.check().await?;
        self.inner.store_refresh_token(user_id, token, ttl).await
    }

    async fn refresh_token(&self, user_id: i64) -> Result<CacheLookup<String>, CacheError> {
        self.check().await?;
        self.inner.refresh_token(user_id).await
    }
}

/// Sequential ids starting at 1000.
#[derive(Default)]
pub struct CountingIds(AtomicUsize);

impl IdGenerator for CountingIds {
    fn next_id(&self) -> i64 {
        1000 + self.0.fetch_add(1, Ordering::SeqCst) as i64
    }
}

/// Services wired the way the binary wires them, over in-memory collaborators.
pub struct Harness {
    pub repos: Arc<MemoryRepos>,
    pub cache: Arc<SwitchableCache>,
    pub log: MemoryEventLog,
    pub community_filter: Arc<ExistenceFilter>,
    pub post_filter: Arc<ExistenceFilter>,
    pub communities: Arc<CommunityService>,
    pub posts: Arc<PostService>,
    pub votes: Arc<VoteLedger>,
    pub policy: CachePolicy,
}

impl Harness {
    /// Filters are loaded from whatever `repos` holds at this point.
    pub async fn build(repos: Arc<MemoryRepos>) -> Self {
        let cache = SwitchableCache::new();
        let log = MemoryEventLog::new();
        let policy = CachePolicy::default();

        let community_ids = repos.list_community_ids().await.expect("community ids");
        let post_ids = repos.list_post_ids().await.expect("post ids");
        let community_filter = Arc::new(ExistenceFilter::load_from(small_filter(), community_ids));
        let post_filter = Arc::new(ExistenceFilter::load_from(small_filter(), post_ids));

        let cache_store: Arc<dyn CacheStore> = cache.clone();
        let communities = Arc::new(CommunityService::new(
            repos.clone(),
            Arc::clone(&cache_store),
            Arc::clone(&community_filter),
        ));
        let posts = Arc::new(PostService::new(
            repos.clone(),
            repos.clone(),
            Arc::clone(&communities),
            Arc::clone(&cache_store),
            Arc::clone(&post_filter),
            Arc::new(CountingIds::default()),
            policy,
        ));
        let votes = Arc::new(VoteLedger::new(
            Arc::clone(&cache_store),
            Arc::clone(&post_filter),
            Arc::new(log.clone()),
            VOTE_STREAM,
        ));

        Self {
            repos,
            cache,
            log,
            community_filter,
            post_filter,
            communities,
            posts,
            votes,
            policy,
        }
    }

    pub fn cache_store(&self) -> Arc<dyn CacheStore> {
        self.cache.clone()
    }

    /// Seed a post everywhere a warmed post lives: database, filter and cache.
    pub async fn seed_post(&self, record: PostRecord) {
        self.repos.insert_post(record.clone());
        self.post_filter.add(record.id);
        self.cache
            .put_fresh_post(&record, self.policy.fresh_entity_ttl)
            .await
            .expect("warm post");
    }
}
