use async_trait::async_trait;
use sqlx::FromRow;
use time::OffsetDateTime;
use tracing::debug;

use crate::application::repos::{BallotWrite, RepoError, VotesRepo};
use crate::domain::entities::VoteBallot;
use crate::domain::types::VoteValue;

use super::{PostgresRepositories, map_sqlx_error};

const SOURCE: &str = "infra::db::votes";

#[derive(FromRow)]
struct BallotRow {
    post_id: i64,
    user_id: i64,
    vote_type: i16,
    created_at: OffsetDateTime,
}

impl TryFrom<BallotRow> for VoteBallot {
    type Error = RepoError;

    fn try_from(row: BallotRow) -> Result<Self, Self::Error> {
        let value = VoteValue::try_from(i64::from(row.vote_type)).map_err(|err| {
            RepoError::Integrity {
                message: err.to_string(),
            }
        })?;

        Ok(Self {
            post_id: row.post_id,
            user_id: row.user_id,
            value,
            created_at: row.created_at,
        })
    }
}

#[async_trait]
impl VotesRepo for PostgresRepositories {
    async fn upsert_ballot(&self, ballot: &VoteBallot) -> Result<BallotWrite, RepoError> {
        // `xmax` is zero only for a freshly inserted tuple.
        let inserted = sqlx::query_scalar::<_, bool>(
            r#"
            INSERT INTO post_votes (post_id, user_id, vote_type, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (post_id, user_id)
            DO UPDATE SET vote_type = EXCLUDED.vote_type, updated_at = now()
            RETURNING (xmax = 0) AS inserted
            "#,
        )
        .bind(ballot.post_id)
        .bind(ballot.user_id)
        .bind(ballot.value.as_i16())
        .bind(ballot.created_at)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        let write = if inserted {
            BallotWrite::Inserted
        } else {
            BallotWrite::Updated
        };

        debug!(
            target = SOURCE,
            post_id = ballot.post_id,
            user_id = ballot.user_id,
            write = write.as_str(),
            "Ballot persisted"
        );

        Ok(write)
    }

    async fn find_ballot(
        &self,
        post_id: i64,
        user_id: i64,
    ) -> Result<Option<VoteBallot>, RepoError> {
        let row = sqlx::query_as::<_, BallotRow>(
            r#"
            SELECT post_id, user_id, vote_type, created_at
            FROM post_votes
            WHERE post_id = $1 AND user_id = $2
            "#,
        )
        .bind(post_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(VoteBallot::try_from).transpose()
    }
}
