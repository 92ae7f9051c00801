mod common;

use std::collections::HashSet;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use lightning::domain::types::VoteValue;
use lightning::infra::telemetry::{
    METRIC_CACHE_HIT_TOTAL, METRIC_CACHE_MISS_TOTAL, METRIC_COALESCED_TOTAL,
    METRIC_FILTER_REJECT_TOTAL, METRIC_INGEST_HANDLE_MS, METRIC_INGEST_MESSAGE_TOTAL,
    METRIC_VOTE_CAST_TOTAL, describe_metrics,
};
use lightning::ingest::{IngestorSettings, VoteReplayIngestor, VoteReplayer};
use metrics_util::debugging::{DebuggingRecorder, Snapshotter};
use serial_test::serial;
use time::macros::datetime;

use common::{Harness, MemoryRepos, VOTE_STREAM, community, post};

fn snapshotter() -> &'static Snapshotter {
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        recorder
            .install()
            .expect("debug metrics recorder should install in this test process");
        describe_metrics();
        snapshotter
    })
}

fn recorded_names() -> HashSet<String> {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, _)| key.key().name().to_string())
        .collect()
}

#[tokio::test]
#[serial]
async fn read_paths_emit_expected_metric_keys() {
    snapshotter();
    let repos = MemoryRepos::new();
    repos.insert_community(community(1, "rust"));
    repos.insert_post(post(10, 1, datetime!(2024-03-02 09:00 UTC)));
    repos.set_read_delay(Duration::from_millis(30));
    let harness = Harness::build(repos).await;

    // Miss, then hit, then a coalesced burst and a filter rejection.
    harness.posts.post(10).await.expect("miss");
    harness.posts.post(10).await.expect("hit");
    join_all((0..4).map(|_| harness.communities.community_detail(1))).await;
    let _ = harness.posts.post(123_456).await;

    let names = recorded_names();
    for expected in [
        METRIC_CACHE_HIT_TOTAL,
        METRIC_CACHE_MISS_TOTAL,
        METRIC_COALESCED_TOTAL,
        METRIC_FILTER_REJECT_TOTAL,
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }
}

#[tokio::test]
#[serial]
async fn vote_and_ingest_paths_emit_expected_metric_keys() {
    snapshotter();
    let repos = MemoryRepos::new();
    repos.insert_community(community(1, "rust"));
    let harness = Harness::build(repos).await;
    harness
        .seed_post(post(10, 1, datetime!(2024-03-02 09:00 UTC)))
        .await;

    harness
        .votes
        .cast(1, 10, VoteValue::Up)
        .await
        .expect("vote");
    let replayer = VoteReplayIngestor::new(
        Arc::new(harness.log.subscribe(VOTE_STREAM, Duration::from_millis(20))),
        VoteReplayer::new(harness.repos.clone()),
        IngestorSettings {
            batch_size: 8,
            retry_backoff: Duration::from_millis(10),
        },
    );
    replayer.poll_once().await.expect("poll");

    let names = recorded_names();
    for expected in [
        METRIC_VOTE_CAST_TOTAL,
        METRIC_INGEST_MESSAGE_TOTAL,
        METRIC_INGEST_HANDLE_MS,
    ] {
        assert!(names.contains(expected), "missing metric {expected}");
    }
}
