use async_trait::async_trait;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::application::repos::{CommunitiesRepo, CreateCommunityParams, RepoError};
use crate::domain::entities::CommunityRecord;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(FromRow)]
struct CommunityRow {
    community_id: i64,
    community_name: String,
    introduction: String,
    created_at: OffsetDateTime,
}

impl From<CommunityRow> for CommunityRecord {
    fn from(row: CommunityRow) -> Self {
        Self {
            id: row.community_id,
            name: row.community_name,
            introduction: row.introduction,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl CommunitiesRepo for PostgresRepositories {
    async fn community_exists(&self, id: i64) -> Result<bool, RepoError> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM communities WHERE community_id = $1)",
        )
        .bind(id)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn find_community(&self, id: i64) -> Result<Option<CommunityRecord>, RepoError> {
        let row = sqlx::query_as::<_, CommunityRow>(
            r#"
            SELECT community_id, community_name, introduction, created_at
            FROM communities
            WHERE community_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(CommunityRecord::from))
    }

    async fn list_communities(&self) -> Result<Vec<CommunityRecord>, RepoError> {
        let rows = sqlx::query_as::<_, CommunityRow>(
            r#"
            SELECT community_id, community_name, introduction, created_at
            FROM communities
            ORDER BY created_at, community_id
            "#,
        )
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(CommunityRecord::from).collect())
    }

    async fn list_community_ids(&self) -> Result<Vec<i64>, RepoError> {
        sqlx::query_scalar::<_, i64>("SELECT community_id FROM communities")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn create_community(
        &self,
        params: CreateCommunityParams,
    ) -> Result<CommunityRecord, RepoError> {
        let row = sqlx::query_as::<_, CommunityRow>(
            r#"
            INSERT INTO communities (community_id, community_name, introduction)
            VALUES ($1, $2, $3)
            RETURNING community_id, community_name, introduction, created_at
            "#,
        )
        .bind(params.id)
        .bind(params.name)
        .bind(params.introduction)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }
}
