//! Repository checks against a real Postgres. Run with `DATABASE_URL` set and `--ignored`.

use lightning::application::repos::{
    BallotWrite, CommunitiesRepo, CreateCommunityParams, CreatePostParams, PostsRepo, RepoError,
    UsersRepo, VotesRepo,
};
use lightning::domain::entities::VoteBallot;
use lightning::domain::types::VoteValue;
use lightning::infra::db::PostgresRepositories;
use sqlx::PgPool;
use time::OffsetDateTime;

async fn seeded(pool: PgPool) -> PostgresRepositories {
    let repos = PostgresRepositories::new(pool);
    sqlx::query("INSERT INTO users (user_id, username) VALUES (7, 'ferris')")
        .execute(repos.pool())
        .await
        .expect("seed user");
    repos
        .create_community(CreateCommunityParams {
            id: 1,
            name: "rust".to_string(),
            introduction: "systems".to_string(),
        })
        .await
        .expect("community");
    repos
        .create_post(CreatePostParams {
            id: 10,
            author_id: 7,
            community_id: 1,
            title: "hello".to_string(),
            content: "world".to_string(),
        })
        .await
        .expect("post");
    repos
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a Postgres database"]
async fn entities_round_trip_through_postgres(pool: PgPool) {
    let repos = seeded(pool).await;

    assert!(repos.community_exists(1).await.expect("exists"));
    assert!(!repos.community_exists(2).await.expect("exists"));
    assert_eq!(repos.list_community_ids().await.expect("ids"), vec![1]);
    assert_eq!(repos.list_post_ids().await.expect("ids"), vec![10]);

    let post = repos.find_post(10).await.expect("find").expect("post");
    assert_eq!(post.community_id, 1);
    assert_eq!(
        repos.find_username(7).await.expect("user").as_deref(),
        Some("ferris")
    );

    let err = repos
        .create_community(CreateCommunityParams {
            id: 1,
            name: "again".to_string(),
            introduction: String::new(),
        })
        .await
        .expect_err("duplicate id");
    assert!(matches!(err, RepoError::Duplicate { .. }));

    let err = repos
        .create_post(CreatePostParams {
            id: 11,
            author_id: 7,
            community_id: 99,
            title: "orphan".to_string(),
            content: "no community".to_string(),
        })
        .await
        .expect_err("missing community");
    assert!(matches!(err, RepoError::InvalidInput { .. }));
}

#[sqlx::test(migrations = "./migrations")]
#[ignore = "requires a Postgres database"]
async fn ballot_upsert_keeps_one_row(pool: PgPool) {
    let repos = seeded(pool).await;
    let mut ballot = VoteBallot {
        post_id: 10,
        user_id: 3,
        value: VoteValue::Up,
        created_at: OffsetDateTime::now_utc(),
    };

    assert_eq!(
        repos.upsert_ballot(&ballot).await.expect("insert"),
        BallotWrite::Inserted
    );
    assert_eq!(
        repos.upsert_ballot(&ballot).await.expect("replay"),
        BallotWrite::Updated
    );
    ballot.value = VoteValue::Down;
    repos.upsert_ballot(&ballot).await.expect("flip");

    let stored = repos
        .find_ballot(10, 3)
        .await
        .expect("find")
        .expect("ballot");
    assert_eq!(stored.value, VoteValue::Down);

    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM post_votes WHERE post_id = 10")
        .fetch_one(repos.pool())
        .await
        .expect("count");
    assert_eq!(rows, 1);
}
