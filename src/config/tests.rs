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

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cache_defaults_match_documented_values() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let cache = settings.cache;

    assert!(cache.enabled);
    assert_eq!(cache.backend, CacheBackendKind::Memory);
    assert_eq!(cache.entity_ttl, Duration::from_secs(300));
    assert_eq!(cache.page_ttl, Duration::from_secs(60));
    assert_eq!(cache.lock_ttl, Duration::from_secs(5));
    assert_eq!(cache.lock_wait_budget, Duration::from_secs(10));
    assert_eq!(cache.backoff_initial, Duration::from_millis(25));
    assert_eq!(cache.backoff_max, Duration::from_millis(400));
    assert_eq!(cache.scan_batch_size.get(), 200);
    assert_eq!((cache.warmup_pages, cache.warmup_limit), (2, 10));
}

#[test]
fn resolved_cache_defaults_match_cache_config_defaults() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    let resolved = crate::cache::CacheConfig::from(&settings.cache);
    let defaults = crate::cache::CacheConfig::default();

    assert_eq!(resolved.entity_policy(), defaults.entity_policy());
    assert_eq!(resolved.page_policy(), defaults.page_policy());
    assert_eq!(resolved.lock_wait(), defaults.lock_wait());
    assert_eq!(resolved.operation_timeout(), defaults.operation_timeout());
    assert_eq!(resolved.redis_url, defaults.redis_url);
    assert_eq!(resolved.scan_batch_size, defaults.scan_batch_size);
    assert_eq!(
        (resolved.warmup_pages, resolved.warmup_limit),
        (defaults.warmup_pages, defaults.warmup_limit)
    );
}

#[test]
fn wait_budget_follows_lock_lease_unless_set() {
    let mut raw = RawSettings::default();
    raw.cache.lock_ttl_ms = Some(800);
    let settings = Settings::from_raw(raw.clone()).expect("valid settings");
    assert_eq!(settings.cache.lock_wait_budget, Duration::from_millis(1_600));

    raw.cache.lock_wait_budget_ms = Some(300);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.lock_wait_budget, Duration::from_millis(300));
}

#[test]
fn zero_ttl_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.page_ttl_secs = Some(0);

    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "cache.page_ttl_secs"),
        other => panic!("expected invalid page ttl, got {other:?}"),
    }
}

#[test]
fn backoff_ceiling_below_start_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.backoff_initial_ms = Some(500);
    raw.cache.backoff_max_ms = Some(100);

    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "cache.backoff_max_ms",
            ..
        })
    ));
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
    let args = CliArgs::parse_from(["quire"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_serve_overrides() {
    let args = CliArgs::parse_from([
        "quire",
        "serve",
        "--server-host",
        "0.0.0.0",
        "--database-url",
        "postgres://override",
        "--cache-backend",
        "redis",
        "--cache-redis-url",
        "redis://cache:6379",
    ]);

    let Some(Command::Serve(serve)) = args.command else {
        panic!("wrong command parsed");
    };
    assert_eq!(serve.overrides.server_host.as_deref(), Some("0.0.0.0"));

    let mut raw = RawSettings::default();
    raw.apply_serve_overrides(&serve.overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.database.url.as_deref(), Some("postgres://override"));
    assert_eq!(settings.cache.backend, CacheBackendKind::Redis);
    assert_eq!(settings.cache.redis_url, "redis://cache:6379");
}

#[test]
fn parse_warm_arguments() {
    let args = CliArgs::parse_from(["quire", "warm", "--pages", "5", "--cache-enabled", "yes"]);

    let mut raw = RawSettings::default();
    raw.cache.enabled = Some(false);
    raw.apply_command_overrides(args.command.as_ref());
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.warmup_pages, 5);
    assert!(settings.cache.enabled);
}

#[test]
fn parse_migrate_arguments() {
    let args = CliArgs::parse_from(["quire", "migrate", "--database-url", "postgres://example"]);

    match args.command.expect("migrate command") {
        Command::Migrate(migrate) => assert_eq!(
            migrate.database.database_url.as_deref(),
            Some("postgres://example")
        ),
        _ => panic!("wrong command parsed"),
    }
}

#[test]
fn backend_kind_parses_case_insensitively() {
    assert_eq!(
        "Redis".parse::<CacheBackendKind>(),
        Ok(CacheBackendKind::Redis)
    );
    assert!("memcached".parse::<CacheBackendKind>().is_err());
}

#[test]
fn layered_sections_deserialize_into_cache_settings() {
    let raw: RawSettings = Config::builder()
        .set_override("cache.backend", "redis")
        .and_then(|builder| builder.set_override("cache.page_ttl_secs", 15))
        .expect("override")
        .build()
        .expect("build")
        .try_deserialize()
        .expect("deserialize");

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.cache.backend, CacheBackendKind::Redis);
    assert_eq!(settings.cache.page_ttl, Duration::from_secs(15));
}
