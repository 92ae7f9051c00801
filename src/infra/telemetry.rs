use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

pub const METRIC_CACHE_HIT_TOTAL: &str = "lightning_cache_hit_total";
pub const METRIC_CACHE_MISS_TOTAL: &str = "lightning_cache_miss_total";
pub const METRIC_FILTER_REJECT_TOTAL: &str = "lightning_filter_reject_total";
pub const METRIC_COALESCED_TOTAL: &str = "lightning_coalesced_total";
pub const METRIC_INGEST_MESSAGE_TOTAL: &str = "lightning_ingest_message_total";
pub const METRIC_INGEST_HANDLE_MS: &str = "lightning_ingest_handle_ms";
pub const METRIC_VOTE_CAST_TOTAL: &str = "lightning_vote_cast_total";

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the service emits. Safe to call more than once.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            METRIC_CACHE_HIT_TOTAL,
            Unit::Count,
            "Cache-aside reads answered by the cache, by resource."
        );
        describe_counter!(
            METRIC_CACHE_MISS_TOTAL,
            Unit::Count,
            "Cache-aside reads that fell through to the database, by resource."
        );
        describe_counter!(
            METRIC_FILTER_REJECT_TOTAL,
            Unit::Count,
            "Lookups rejected by an existence filter without touching any store."
        );
        describe_counter!(
            METRIC_COALESCED_TOTAL,
            Unit::Count,
            "Callers that joined an in-flight computation instead of starting their own."
        );
        describe_counter!(
            METRIC_INGEST_MESSAGE_TOTAL,
            Unit::Count,
            "Event log messages handled by the ingestors, by stream and outcome."
        );
        describe_histogram!(
            METRIC_INGEST_HANDLE_MS,
            Unit::Milliseconds,
            "Time spent applying one event log message."
        );
        describe_counter!(
            METRIC_VOTE_CAST_TOTAL,
            Unit::Count,
            "Vote requests, by outcome."
        );
    });
}
