use clap::Parser;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.public_addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_match_the_cache_policy() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.cache.backend, CacheBackend::Redis);
    assert_eq!(settings.cache.fresh_entity_ttl, Duration::from_secs(86_400));
    assert_eq!(settings.cache.backfill_entity_ttl, Duration::from_secs(86_400));
    assert_eq!(settings.cache.community_ranking_ttl, Duration::from_secs(60));
    assert_eq!(settings.cache.page_cursor_lifetime, Duration::from_secs(14_400));
    assert_eq!(settings.cache.default_page_size.get(), 2);
    assert_eq!(settings.cache.max_page_size.get(), 50);
    assert_eq!(settings.server.graceful_shutdown, Duration::from_secs(5));

    let sizing = settings.filter.sizing();
    assert_eq!(sizing.expected_items, 1_000_000);
    assert_eq!(sizing.hash_rounds, 5);
    assert!(!settings.ingest.publish_changes);
}

#[test]
fn zero_port_is_rejected() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero port");
    assert!(matches!(err, LoadError::Invalid { key: "server.port", .. }));
}

#[test]
fn zero_counts_are_rejected() {
    let mut raw = RawSettings::default();
    raw.ingest.batch_size = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero batch");
    assert!(matches!(err, LoadError::Invalid { key: "ingest.batch_size", .. }));

    let mut raw = RawSettings::default();
    raw.cache.community_ranking_ttl_seconds = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn default_page_size_may_not_exceed_max() {
    let mut raw = RawSettings::default();
    raw.cache.default_page_size = Some(80);
    let err = Settings::from_raw(raw).expect_err("oversized default");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.default_page_size",
            ..
        }
    ));
}

#[test]
fn false_positive_rate_must_be_a_probability() {
    for rate in [0.0, 1.0, -0.5, 2.0] {
        let mut raw = RawSettings::default();
        raw.filter.false_positive_rate = Some(rate);
        assert!(Settings::from_raw(raw).is_err(), "rate {rate} accepted");
    }
}

#[test]
fn vote_stream_must_be_distinct() {
    let mut raw = RawSettings::default();
    raw.ingest.vote_stream = Some(DEFAULT_POST_STREAM.to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn id_epoch_parses_dates_only() {
    let mut raw = RawSettings::default();
    raw.ids.epoch = Some("2023-06-01".to_string());
    raw.ids.machine_id = Some(12);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.ids.epoch, time::macros::datetime!(2023-06-01 00:00 UTC));
    assert_eq!(settings.ids.machine_id, 12);

    let mut raw = RawSettings::default();
    raw.ids.epoch = Some("June 2023".to_string());
    assert!(Settings::from_raw(raw).is_err());

    let mut raw = RawSettings::default();
    raw.ids.machine_id = Some(2048);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cache_backend_accepts_any_case() {
    let mut raw = RawSettings::default();
    raw.cache.backend = Some("Memory".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.backend, CacheBackend::Memory);

    let mut raw = RawSettings::default();
    raw.cache.backend = Some("memcached".to_string());
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["lightning"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "lightning",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--database-url",
        "postgres://override",
        "--cache-backend",
        "memory",
    ]);

    match args.command.expect("serve command") {
        Command::Serve(serve) => {
            assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));
            assert_eq!(
                serve.overrides.database_url.as_deref(),
                Some("postgres://override")
            );
            assert_eq!(serve.overrides.cache_backend, Some(CacheBackend::Memory));

            let mut raw = RawSettings::default();
            raw.apply_serve_overrides(&serve.overrides);
            let settings = Settings::from_raw(raw).expect("valid settings");
            assert_eq!(settings.cache.backend, CacheBackend::Memory);
        }
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from([
        "lightning",
        "migrate",
        "--database-url",
        "postgres://example",
    ]);

    match args.command.expect("migrate command") {
        Command::Migrate(migrate) => {
            assert_eq!(
                migrate.database.database_url.as_deref(),
                Some("postgres://example")
            );
        }
        _ => panic!("wrong command parsed"),
    }
}
