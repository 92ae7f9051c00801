use std::{process, sync::Arc, time::Duration};

use deadpool_redis::Pool;
use lightning::{
    application::{
        changes::ChangeFeed,
        communities::CommunityService,
        error::AppError,
        ids::{IdGenerator, SnowflakeIds},
        posts::PostService,
        repos::{CommunitiesRepo, PostsRepo, UsersRepo, VotesRepo},
        votes::VoteLedger,
    },
    cache::{CachePolicy, CacheStore, ExistenceFilter, MemoryCacheStore, RedisCacheStore},
    config::{self, CacheBackend},
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        redis as redis_pool, telemetry,
    },
    ingest::{
        EntityIngestor, EntityWarmer, EventSink, EventSource, IngestorSettings, MemoryEventLog,
        RedisStreamLog, RedisStreamSink, VoteReplayIngestor, VoteReplayer,
    },
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

const SOURCE: &str = "lightning::main";

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_database(&settings).await?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    info!(target = SOURCE, "Database migrations applied");
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let repositories = init_repositories(&settings).await?;
    let backend = EventBackend::connect(&settings).await?;
    let app = build_application(repositories, &backend, &settings).await?;

    let cancel = CancellationToken::new();
    let ingestors = spawn_ingestors(&app, &backend, &settings, &cancel);

    let result = serve_http(&settings, app.http_state, cancel.clone()).await;

    cancel.cancel();
    for handle in ingestors {
        if let Err(err) = handle.await {
            warn!(target = SOURCE, error = %err, "Ingestor task ended abnormally");
        }
    }
    info!(target = SOURCE, "Shutdown complete");

    result
}

async fn connect_database(settings: &config::Settings) -> Result<sqlx::PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))
}

async fn init_repositories(
    settings: &config::Settings,
) -> Result<Arc<PostgresRepositories>, AppError> {
    let pool = connect_database(settings).await?;
    PostgresRepositories::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;
    Ok(Arc::new(PostgresRepositories::new(pool)))
}

/// Where the cache lives and where events are published and consumed.
enum EventBackend {
    Redis(Pool),
    Memory {
        cache: Arc<MemoryCacheStore>,
        log: MemoryEventLog,
    },
}

impl EventBackend {
    async fn connect(settings: &config::Settings) -> Result<Self, AppError> {
        match settings.cache.backend {
            CacheBackend::Redis => {
                let pool = redis_pool::connect(&settings.redis).await?;
                Ok(Self::Redis(pool))
            }
            CacheBackend::Memory => {
                warn!(
                    target = SOURCE,
                    "Using the in-process cache and event log; state is lost on restart"
                );
                Ok(Self::Memory {
                    cache: Arc::new(MemoryCacheStore::new()),
                    log: MemoryEventLog::new(),
                })
            }
        }
    }

    fn cache(&self) -> Arc<dyn CacheStore> {
        match self {
            Self::Redis(pool) => Arc::new(RedisCacheStore::new(pool.clone())),
            Self::Memory { cache, .. } => Arc::clone(cache) as Arc<dyn CacheStore>,
        }
    }

    fn sink(&self) -> Arc<dyn EventSink> {
        match self {
            Self::Redis(pool) => Arc::new(RedisStreamSink::new(pool.clone())),
            Self::Memory { log, .. } => Arc::new(log.clone()),
        }
    }

    fn source(&self, stream: &str, ingest: &config::IngestSettings) -> Arc<dyn EventSource> {
        match self {
            Self::Redis(pool) => Arc::new(RedisStreamLog::new(
                pool.clone(),
                stream,
                ingest.group.as_str(),
                ingest.consumer.as_str(),
                ingest.block,
            )),
            Self::Memory { log, .. } => Arc::new(log.subscribe(stream, ingest.block)),
        }
    }

    /// Without an external change capture process nothing else feeds the in-process log.
    fn publishes_changes(&self, ingest: &config::IngestSettings) -> bool {
        matches!(self, Self::Memory { .. }) || ingest.publish_changes
    }
}

struct Application {
    http_state: HttpState,
    repositories: Arc<PostgresRepositories>,
    cache: Arc<dyn CacheStore>,
    community_filter: Arc<ExistenceFilter>,
    post_filter: Arc<ExistenceFilter>,
    policy: CachePolicy,
}

async fn build_application(
    repositories: Arc<PostgresRepositories>,
    backend: &EventBackend,
    settings: &config::Settings,
) -> Result<Application, AppError> {
    let communities_repo: Arc<dyn CommunitiesRepo> = repositories.clone();
    let posts_repo: Arc<dyn PostsRepo> = repositories.clone();
    let users_repo: Arc<dyn UsersRepo> = repositories.clone();

    let sizing = settings.filter.sizing();
    let community_ids = communities_repo.list_community_ids().await?;
    let post_ids = posts_repo.list_post_ids().await?;
    info!(
        target = SOURCE,
        communities = community_ids.len(),
        posts = post_ids.len(),
        bits = sizing.bit_count(),
        "Loaded existence filters"
    );
    let community_filter = Arc::new(ExistenceFilter::load_from(sizing, community_ids));
    let post_filter = Arc::new(ExistenceFilter::load_from(sizing, post_ids));

    let cache = backend.cache();
    let sink = backend.sink();
    let policy = CachePolicy::from(&settings.cache);
    let ids: Arc<dyn IdGenerator> = Arc::new(
        SnowflakeIds::new(settings.ids.machine_id, settings.ids.epoch).map_err(AppError::from)?,
    );

    let mut communities = CommunityService::new(
        communities_repo,
        cache.clone(),
        community_filter.clone(),
    );
    if backend.publishes_changes(&settings.ingest) {
        info!(target = SOURCE, "Publishing insert events from the write path");
        communities = communities.with_change_feed(ChangeFeed::new(
            sink.clone(),
            settings.ingest.community_stream.as_str(),
        ));
    }
    let communities = Arc::new(communities);

    let mut posts = PostService::new(
        posts_repo,
        users_repo,
        communities.clone(),
        cache.clone(),
        post_filter.clone(),
        ids,
        policy,
    );
    if backend.publishes_changes(&settings.ingest) {
        posts = posts.with_change_feed(ChangeFeed::new(
            sink.clone(),
            settings.ingest.post_stream.as_str(),
        ));
    }
    let votes = VoteLedger::new(
        cache.clone(),
        post_filter.clone(),
        sink,
        settings.ingest.vote_stream.as_str(),
    );

    let http_state = HttpState {
        communities,
        posts: Arc::new(posts),
        votes: Arc::new(votes),
        health: repositories.clone(),
    };

    Ok(Application {
        http_state,
        repositories,
        cache,
        community_filter,
        post_filter,
        policy,
    })
}

fn spawn_ingestors(
    app: &Application,
    backend: &EventBackend,
    settings: &config::Settings,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<()>> {
    let ingest = &settings.ingest;
    let ingestor_settings = IngestorSettings {
        batch_size: ingest.batch_size.get() as usize,
        retry_backoff: ingest.retry_backoff,
    };

    let mut handles = Vec::new();
    for stream in [&ingest.community_stream, &ingest.post_stream] {
        let warmer = EntityWarmer::new(
            app.cache.clone(),
            app.community_filter.clone(),
            app.post_filter.clone(),
            app.policy,
        );
        let ingestor = EntityIngestor::new(
            backend.source(stream, ingest),
            warmer,
            ingestor_settings,
        );
        handles.push(tokio::spawn(ingestor.run(cancel.clone())));
    }

    let votes_repo: Arc<dyn VotesRepo> = app.repositories.clone();
    let replayer = VoteReplayIngestor::new(
        backend.source(&ingest.vote_stream, ingest),
        VoteReplayer::new(votes_repo),
        ingestor_settings,
    );
    handles.push(tokio::spawn(replayer.run(cancel.clone())));

    info!(
        target = SOURCE,
        community_stream = %ingest.community_stream,
        post_stream = %ingest.post_stream,
        vote_stream = %ingest.vote_stream,
        "Ingestors started"
    );
    handles
}

async fn serve_http(
    settings: &config::Settings,
    http_state: HttpState,
    cancel: CancellationToken,
) -> Result<(), AppError> {
    let router = http::build_router(http_state);
    let listener = tokio::net::TcpListener::bind(settings.server.public_addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(
        target = SOURCE,
        addr = %settings.server.public_addr,
        "HTTP server listening"
    );

    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!(target = SOURCE, "Shutdown signal received");
        signal_token.cancel();
    });

    let drain_token = cancel.clone();
    let mut server = tokio::spawn(
        axum::serve(listener, router.into_make_service())
            .with_graceful_shutdown(async move { drain_token.cancelled_owned().await })
            .into_future(),
    );

    tokio::select! {
        joined = &mut server => return server_outcome(joined),
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(settings.server.graceful_shutdown, &mut server).await {
        Ok(joined) => server_outcome(joined),
        Err(_) => {
            warn!(
                target = SOURCE,
                grace_ms = duration_ms(settings.server.graceful_shutdown),
                "In-flight requests did not drain in time"
            );
            server.abort();
            Ok(())
        }
    }
}

fn server_outcome(
    joined: Result<Result<(), std::io::Error>, tokio::task::JoinError>,
) -> Result<(), AppError> {
    match joined {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(AppError::unexpected(format!("server error: {err}"))),
        Err(err) => Err(AppError::unexpected(format!("server task failed: {err}"))),
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(target = SOURCE, error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!(target = SOURCE, error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
