//! Redis connection pool shared by the cache store and the stream log.

use deadpool_redis::{Config, Pool, PoolConfig, Runtime, Timeouts};
use tracing::info;

use crate::config::RedisSettings;

use super::error::InfraError;

const SOURCE: &str = "infra::redis";

/// Build the pool and verify one round-trip so a bad URL fails at startup.
pub async fn connect(settings: &RedisSettings) -> Result<Pool, InfraError> {
    let mut config = Config::from_url(settings.url.as_str());
    let mut pool_config = PoolConfig::new(settings.pool_size.get() as usize);
    pool_config.timeouts = Timeouts::wait_millis(settings.timeout.as_millis() as u64);
    config.pool = Some(pool_config);

    let pool = config
        .create_pool(Some(Runtime::Tokio1))
        .map_err(|err| InfraError::redis(format!("failed to build pool: {err}")))?;

    ping(&pool).await?;
    info!(
        target = SOURCE,
        pool_size = settings.pool_size.get(),
        "Connected to Redis"
    );
    Ok(pool)
}

pub async fn ping(pool: &Pool) -> Result<(), InfraError> {
    let mut conn = pool
        .get()
        .await
        .map_err(|err| InfraError::redis(format!("failed to check out connection: {err}")))?;
    redis::cmd("PING")
        .query_async::<String>(&mut conn)
        .await
        .map(|_| ())
        .map_err(|err| InfraError::redis(format!("PING failed: {err}")))
}
