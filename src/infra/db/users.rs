use async_trait::async_trait;

use crate::application::repos::{RepoError, UsersRepo};

use super::{PostgresRepositories, map_sqlx_error};

#[async_trait]
impl UsersRepo for PostgresRepositories {
    async fn find_username(&self, user_id: i64) -> Result<Option<String>, RepoError> {
        sqlx::query_scalar::<_, String>("SELECT username FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_error)
    }
}
