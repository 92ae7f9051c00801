use async_trait::async_trait;
use sqlx::FromRow;
use time::OffsetDateTime;

use crate::application::repos::{CreatePostParams, PostsRepo, RepoError};
use crate::domain::entities::PostRecord;

use super::{PostgresRepositories, map_sqlx_error};

#[derive(FromRow)]
struct PostRow {
    post_id: i64,
    author_id: i64,
    community_id: i64,
    title: String,
    content: String,
    created_at: OffsetDateTime,
}

impl From<PostRow> for PostRecord {
    fn from(row: PostRow) -> Self {
        Self {
            id: row.post_id,
            author_id: row.author_id,
            community_id: row.community_id,
            title: row.title,
            content: row.content,
            created_at: row.created_at,
        }
    }
}

#[async_trait]
impl PostsRepo for PostgresRepositories {
    async fn find_post(&self, id: i64) -> Result<Option<PostRecord>, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            SELECT post_id, author_id, community_id, title, content, created_at
            FROM posts
            WHERE post_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(PostRecord::from))
    }

    async fn list_post_ids(&self) -> Result<Vec<i64>, RepoError> {
        sqlx::query_scalar::<_, i64>("SELECT post_id FROM posts")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)
    }

    async fn create_post(&self, params: CreatePostParams) -> Result<PostRecord, RepoError> {
        let row = sqlx::query_as::<_, PostRow>(
            r#"
            INSERT INTO posts (post_id, author_id, community_id, title, content)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING post_id, author_id, community_id, title, content, created_at
            "#,
        )
        .bind(params.id)
        .bind(params.author_id)
        .bind(params.community_id)
        .bind(params.title)
        .bind(params.content)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.into())
    }
}
