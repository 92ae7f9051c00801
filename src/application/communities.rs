//! Community creation and cache-aside reads.

use std::sync::Arc;

use metrics::counter;
use tracing::{debug, error, info, warn};

use crate::application::changes::ChangeFeed;
use crate::application::error::{AppError, ConflictKind};
use crate::application::repos::{CommunitiesRepo, CreateCommunityParams, RepoError};
use crate::cache::{CacheKey, CacheLookup, CacheStore, ExistenceFilter, RequestCoalescer};
use crate::domain::entities::{CommunityRecord, CommunitySummary};
use crate::infra::telemetry::{
    METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_FILTER_REJECT_TOTAL,
};
use crate::ingest::ChangeEvent;

const SOURCE: &str = "application::communities";

pub struct CommunityService {
    communities: Arc<dyn CommunitiesRepo>,
    cache: Arc<dyn CacheStore>,
    filter: Arc<ExistenceFilter>,
    detail_flights: RequestCoalescer<CommunityRecord, AppError>,
    list_flights: RequestCoalescer<Vec<CommunitySummary>, AppError>,
    changes: Option<ChangeFeed>,
}

impl CommunityService {
    pub fn new(
        communities: Arc<dyn CommunitiesRepo>,
        cache: Arc<dyn CacheStore>,
        filter: Arc<ExistenceFilter>,
    ) -> Self {
        Self {
            communities,
            cache,
            filter,
            detail_flights: RequestCoalescer::new("community_detail"),
            list_flights: RequestCoalescer::new("community_list"),
            changes: None,
        }
    }

    /// Publish an insert event for every community created through this service.
    pub fn with_change_feed(mut self, changes: ChangeFeed) -> Self {
        self.changes = Some(changes);
        self
    }

    pub fn filter(&self) -> &Arc<ExistenceFilter> {
        &self.filter
    }

    pub async fn create_community(
        &self,
        id: i64,
        name: &str,
        introduction: &str,
    ) -> Result<CommunityRecord, AppError> {
        let name = name.trim();
        if id <= 0 {
            return Err(AppError::validation("community id must be positive"));
        }
        if name.is_empty() {
            return Err(AppError::validation("community name must not be empty"));
        }

        if self.communities.community_exists(id).await? {
            info!(
                target = SOURCE,
                community_id = id,
                "Rejected community creation for existing id"
            );
            return Err(AppError::Conflict(ConflictKind::DuplicateCommunity));
        }

        let record = self
            .communities
            .create_community(CreateCommunityParams {
                id,
                name: name.to_string(),
                introduction: introduction.trim().to_string(),
            })
            .await
            .map_err(|err| match err {
                RepoError::Duplicate { .. } => AppError::Conflict(ConflictKind::DuplicateCommunity),
                other => AppError::from(other),
            })?;

        self.filter.add(record.id);
        info!(
            target = SOURCE,
            community_id = record.id,
            name = %record.name,
            "Created community"
        );
        if let Some(changes) = &self.changes
            && changes
                .publish(&ChangeEvent::community_inserted(&record))
                .await
                .is_err()
        {
            match self.cache.put_community(&record).await {
                Ok(()) => info!(
                    target = SOURCE,
                    community_id = record.id,
                    "Warmed created community without a change event"
                ),
                Err(err) => error!(
                    target = SOURCE,
                    community_id = record.id,
                    error = %err,
                    "Created community is missing from the community list"
                ),
            }
        }
        Ok(record)
    }

    /// Authoritative existence check, used by write paths that need certainty.
    pub async fn community_exists(&self, id: i64) -> Result<bool, AppError> {
        if !self.filter.might_exist(id) {
            counter!(METRIC_FILTER_REJECT_TOTAL, "kind" => "community").increment(1);
            return Ok(false);
        }
        Ok(self.communities.community_exists(id).await?)
    }

    pub async fn community_detail(&self, id: i64) -> Result<CommunityRecord, AppError> {
        if !self.filter.might_exist(id) {
            counter!(METRIC_FILTER_REJECT_TOTAL, "kind" => "community").increment(1);
            debug!(target = SOURCE, community_id = id, "Existence filter rejected community");
            return Err(AppError::not_found("community"));
        }
        self.detail_flights
            .run(CacheKey::Community(id), || self.load_community(id))
            .await
    }

    async fn load_community(&self, id: i64) -> Result<CommunityRecord, AppError> {
        match self.cache.community(id).await {
            Ok(CacheLookup::Found(record)) => {
                counter!(METRIC_CACHE_HIT_TOTAL, "resource" => "community").increment(1);
                Ok(record)
            }
            Ok(CacheLookup::NotFound) => {
                counter!(METRIC_CACHE_MISS_TOTAL, "resource" => "community").increment(1);
                debug!(target = SOURCE, community_id = id, "Community not cached");
                let Some(record) = self.communities.find_community(id).await? else {
                    debug!(target = SOURCE, community_id = id, "Community does not exist");
                    return Err(AppError::not_found("community"));
                };
                if let Err(err) = self.cache.backfill_community(&record).await {
                    warn!(
                        target = SOURCE,
                        community_id = id,
                        error = %err,
                        "Failed to backfill community"
                    );
                }
                Ok(record)
            }
            Err(err) => {
                error!(
                    target = SOURCE,
                    community_id = id,
                    error = %err,
                    "Community cache read failed"
                );
                Err(err.into())
            }
        }
    }

    /// Every community's `(id, name)` in creation order.
    pub async fn community_list(&self) -> Result<Vec<CommunitySummary>, AppError> {
        self.list_flights
            .run(CacheKey::CommunityList, || self.load_community_list())
            .await
    }

    async fn load_community_list(&self) -> Result<Vec<CommunitySummary>, AppError> {
        match self.cache.community_list().await {
            Ok(CacheLookup::Found(list)) => {
                counter!(METRIC_CACHE_HIT_TOTAL, "resource" => "community_list").increment(1);
                Ok(list)
            }
            Ok(CacheLookup::NotFound) => {
                counter!(METRIC_CACHE_MISS_TOTAL, "resource" => "community_list").increment(1);
                info!(target = SOURCE, "Community list not cached, rebuilding");
                let records = self.communities.list_communities().await?;
                let mut list = Vec::with_capacity(records.len());
                for record in &records {
                    if let Err(err) = self.cache.put_community(record).await {
                        warn!(
                            target = SOURCE,
                            community_id = record.id,
                            error = %err,
                            "Failed to repopulate community"
                        );
                    }
                    list.push(CommunitySummary::from(record));
                }
                Ok(list)
            }
            Err(err) => {
                error!(target = SOURCE, error = %err, "Community list cache read failed");
                Err(err.into())
            }
        }
    }
}
