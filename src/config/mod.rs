//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    net::SocketAddr,
    num::{NonZeroU16, NonZeroU32},
    str::FromStr,
    time::Duration,
};

use clap::{Parser, ValueEnum};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use time::{Date, OffsetDateTime, macros::format_description};
use tracing::level_filters::LevelFilter;

use crate::cache::FilterSizing;

mod cli;

pub use cli::{
    CacheBackend, CliArgs, Command, DatabaseOverride, MigrateArgs, ServeArgs, ServeOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "lightning";
const ENV_PREFIX: &str = "LIGHTNING";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 5;
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_REDIS_POOL_SIZE: u32 = 16;
const DEFAULT_REDIS_TIMEOUT_SECS: u64 = 5;
const DEFAULT_FRESH_ENTITY_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_BACKFILL_ENTITY_TTL_SECS: u64 = 24 * 60 * 60;
const DEFAULT_COMMUNITY_RANKING_TTL_SECS: u64 = 60;
const DEFAULT_PAGE_CURSOR_LIFETIME_SECS: u64 = 4 * 60 * 60;
const DEFAULT_PAGE_SIZE: u32 = 2;
const DEFAULT_MAX_PAGE_SIZE: u32 = 50;
const DEFAULT_FILTER_EXPECTED_ITEMS: u64 = 1_000_000;
const DEFAULT_FILTER_FALSE_POSITIVE_RATE: f64 = 0.01;
const DEFAULT_FILTER_HASH_ROUNDS: u32 = 5;
const DEFAULT_COMMUNITY_STREAM: &str = "lightning:stream:community";
const DEFAULT_POST_STREAM: &str = "lightning:stream:post";
const DEFAULT_VOTE_STREAM: &str = "lightning:stream:vote_post";
const DEFAULT_INGEST_GROUP: &str = "lightning";
const DEFAULT_INGEST_CONSUMER: &str = "lightning-0";
const DEFAULT_INGEST_BATCH_SIZE: u32 = 64;
const DEFAULT_INGEST_BLOCK_MS: u64 = 2_000;
const DEFAULT_INGEST_RETRY_BACKOFF_MS: u64 = 1_000;
const DEFAULT_MACHINE_ID: u16 = 1;
const DEFAULT_ID_EPOCH: &str = "2024-01-01";
const MAX_MACHINE_ID: u16 = 1023;

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub redis: RedisSettings,
    pub cache: CacheSettings,
    pub filter: FilterSettings,
    pub ingest: IngestSettings,
    pub ids: IdSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_addr: SocketAddr,
    pub graceful_shutdown: Duration,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub pool_size: NonZeroU32,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub backend: CacheBackend,
    pub fresh_entity_ttl: Duration,
    pub backfill_entity_ttl: Duration,
    pub community_ranking_ttl: Duration,
    pub page_cursor_lifetime: Duration,
    pub default_page_size: NonZeroU32,
    pub max_page_size: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct FilterSettings {
    pub expected_items: usize,
    pub false_positive_rate: f64,
    pub hash_rounds: NonZeroU32,
}

impl FilterSettings {
    pub fn sizing(&self) -> FilterSizing {
        FilterSizing {
            expected_items: self.expected_items,
            false_positive_rate: self.false_positive_rate,
            hash_rounds: self.hash_rounds.get(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub community_stream: String,
    pub post_stream: String,
    pub vote_stream: String,
    pub group: String,
    /// Must be unique per instance and stable across its restarts.
    pub consumer: String,
    pub batch_size: NonZeroU32,
    pub block: Duration,
    pub retry_backoff: Duration,
    /// Publish insert events for entities created through the API.
    pub publish_changes: bool,
}

#[derive(Debug, Clone)]
pub struct IdSettings {
    pub machine_id: u16,
    pub epoch: OffsetDateTime,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Migrate(args)) => raw.apply_database_override(&args.database),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    redis: RawRedisSettings,
    cache: RawCacheSettings,
    filter: RawFilterSettings,
    ingest: RawIngestSettings,
    ids: RawIdSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.server_graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if let Some(max) = overrides.database_max_connections {
            self.database.max_connections = Some(max);
        }
        if let Some(url) = overrides.redis_url.as_ref() {
            self.redis.url = Some(url.clone());
        }
        if let Some(backend) = overrides.cache_backend {
            self.cache.backend = backend
                .to_possible_value()
                .map(|value| value.get_name().to_string());
        }
    }

    fn apply_database_override(&mut self, overrides: &DatabaseOverride) {
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            database,
            redis,
            cache,
            filter,
            ingest,
            ids,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            database: build_database_settings(database)?,
            redis: build_redis_settings(redis)?,
            cache: build_cache_settings(cache)?,
            filter: build_filter_settings(filter)?,
            ingest: build_ingest_settings(ingest)?,
            ids: build_id_settings(ids)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    let port = NonZeroU16::new(port)
        .ok_or_else(|| LoadError::invalid("server.port", "port must be greater than zero"))?;

    let public_addr = parse_socket_addr(&host, port.get())
        .map_err(|reason| LoadError::invalid("server.public_addr", reason))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    let graceful_shutdown =
        non_zero_duration_secs(graceful_secs, "server.graceful_shutdown_seconds")?;

    Ok(ServerSettings {
        public_addr,
        graceful_shutdown,
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_redis_settings(redis: RawRedisSettings) -> Result<RedisSettings, LoadError> {
    let url = redis
        .url
        .map(|value| value.trim().to_string())
        .unwrap_or_else(|| DEFAULT_REDIS_URL.to_string());
    if url.is_empty() {
        return Err(LoadError::invalid("redis.url", "must not be empty"));
    }

    Ok(RedisSettings {
        url,
        pool_size: non_zero_u32(
            redis.pool_size.unwrap_or(DEFAULT_REDIS_POOL_SIZE).into(),
            "redis.pool_size",
        )?,
        timeout: non_zero_duration_secs(
            redis.timeout_seconds.unwrap_or(DEFAULT_REDIS_TIMEOUT_SECS),
            "redis.timeout_seconds",
        )?,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let backend = match cache.backend {
        Some(raw) => <CacheBackend as ValueEnum>::from_str(raw.trim(), true)
            .map_err(|err| LoadError::invalid("cache.backend", err))?,
        None => CacheBackend::Redis,
    };

    let default_page_size = non_zero_u32(
        cache.default_page_size.unwrap_or(DEFAULT_PAGE_SIZE).into(),
        "cache.default_page_size",
    )?;
    let max_page_size = non_zero_u32(
        cache.max_page_size.unwrap_or(DEFAULT_MAX_PAGE_SIZE).into(),
        "cache.max_page_size",
    )?;
    if default_page_size > max_page_size {
        return Err(LoadError::invalid(
            "cache.default_page_size",
            format!("must not exceed cache.max_page_size ({max_page_size})"),
        ));
    }

    Ok(CacheSettings {
        backend,
        fresh_entity_ttl: non_zero_duration_secs(
            cache
                .fresh_entity_ttl_seconds
                .unwrap_or(DEFAULT_FRESH_ENTITY_TTL_SECS),
            "cache.fresh_entity_ttl_seconds",
        )?,
        backfill_entity_ttl: non_zero_duration_secs(
            cache
                .backfill_entity_ttl_seconds
                .unwrap_or(DEFAULT_BACKFILL_ENTITY_TTL_SECS),
            "cache.backfill_entity_ttl_seconds",
        )?,
        community_ranking_ttl: non_zero_duration_secs(
            cache
                .community_ranking_ttl_seconds
                .unwrap_or(DEFAULT_COMMUNITY_RANKING_TTL_SECS),
            "cache.community_ranking_ttl_seconds",
        )?,
        page_cursor_lifetime: non_zero_duration_secs(
            cache
                .page_cursor_lifetime_seconds
                .unwrap_or(DEFAULT_PAGE_CURSOR_LIFETIME_SECS),
            "cache.page_cursor_lifetime_seconds",
        )?,
        default_page_size,
        max_page_size,
    })
}

fn build_filter_settings(filter: RawFilterSettings) -> Result<FilterSettings, LoadError> {
    let expected_items = filter
        .expected_items
        .unwrap_or(DEFAULT_FILTER_EXPECTED_ITEMS);
    if expected_items == 0 {
        return Err(LoadError::invalid("filter.expected_items", "must be greater than zero"));
    }
    let expected_items = usize::try_from(expected_items).map_err(|_| {
        LoadError::invalid(
            "filter.expected_items",
            "value exceeds supported range for usize",
        )
    })?;

    let false_positive_rate = filter
        .false_positive_rate
        .unwrap_or(DEFAULT_FILTER_FALSE_POSITIVE_RATE);
    if !(false_positive_rate > 0.0 && false_positive_rate < 1.0) {
        return Err(LoadError::invalid(
            "filter.false_positive_rate",
            "must lie strictly between 0 and 1",
        ));
    }

    Ok(FilterSettings {
        expected_items,
        false_positive_rate,
        hash_rounds: non_zero_u32(
            filter.hash_rounds.unwrap_or(DEFAULT_FILTER_HASH_ROUNDS).into(),
            "filter.hash_rounds",
        )?,
    })
}

fn build_ingest_settings(ingest: RawIngestSettings) -> Result<IngestSettings, LoadError> {
    let community_stream = non_empty(
        ingest.community_stream,
        DEFAULT_COMMUNITY_STREAM,
        "ingest.community_stream",
    )?;
    let post_stream = non_empty(ingest.post_stream, DEFAULT_POST_STREAM, "ingest.post_stream")?;
    let vote_stream = non_empty(ingest.vote_stream, DEFAULT_VOTE_STREAM, "ingest.vote_stream")?;
    if vote_stream == community_stream || vote_stream == post_stream {
        return Err(LoadError::invalid("ingest.vote_stream", "must differ from the entity streams"));
    }

    Ok(IngestSettings {
        community_stream,
        post_stream,
        vote_stream,
        group: non_empty(ingest.group, DEFAULT_INGEST_GROUP, "ingest.group")?,
        consumer: non_empty(ingest.consumer, DEFAULT_INGEST_CONSUMER, "ingest.consumer")?,
        batch_size: non_zero_u32(
            ingest.batch_size.unwrap_or(DEFAULT_INGEST_BATCH_SIZE).into(),
            "ingest.batch_size",
        )?,
        block: non_zero_duration_ms(
            ingest.block_ms.unwrap_or(DEFAULT_INGEST_BLOCK_MS),
            "ingest.block_ms",
        )?,
        retry_backoff: non_zero_duration_ms(
            ingest
                .retry_backoff_ms
                .unwrap_or(DEFAULT_INGEST_RETRY_BACKOFF_MS),
            "ingest.retry_backoff_ms",
        )?,
        publish_changes: ingest.publish_changes.unwrap_or(false),
    })
}

fn build_id_settings(ids: RawIdSettings) -> Result<IdSettings, LoadError> {
    let machine_id = ids.machine_id.unwrap_or(DEFAULT_MACHINE_ID);
    if machine_id > MAX_MACHINE_ID {
        return Err(LoadError::invalid(
            "ids.machine_id",
            format!("must be at most {MAX_MACHINE_ID}"),
        ));
    }

    let raw_epoch = ids.epoch.unwrap_or_else(|| DEFAULT_ID_EPOCH.to_string());
    let epoch = Date::parse(raw_epoch.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| LoadError::invalid("ids.epoch", format!("expected YYYY-MM-DD: {err}")))?
        .midnight()
        .assume_utc();
    if epoch > OffsetDateTime::now_utc() {
        return Err(LoadError::invalid("ids.epoch", "must not lie in the future"));
    }

    Ok(IdSettings { machine_id, epoch })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRedisSettings {
    url: Option<String>,
    pool_size: Option<u32>,
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    backend: Option<String>,
    fresh_entity_ttl_seconds: Option<u64>,
    backfill_entity_ttl_seconds: Option<u64>,
    community_ranking_ttl_seconds: Option<u64>,
    page_cursor_lifetime_seconds: Option<u64>,
    default_page_size: Option<u32>,
    max_page_size: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFilterSettings {
    expected_items: Option<u64>,
    false_positive_rate: Option<f64>,
    hash_rounds: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIngestSettings {
    community_stream: Option<String>,
    post_stream: Option<String>,
    vote_stream: Option<String>,
    group: Option<String>,
    consumer: Option<String>,
    batch_size: Option<u32>,
    block_ms: Option<u64>,
    retry_backoff_ms: Option<u64>,
    publish_changes: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawIdSettings {
    machine_id: Option<u16>,
    epoch: Option<String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_duration_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn non_zero_duration_ms(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn non_empty(value: Option<String>, default: &str, key: &'static str) -> Result<String, LoadError> {
    let value = value.unwrap_or_else(|| default.to_string());
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LoadError::invalid(key, "must not be empty"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests;
