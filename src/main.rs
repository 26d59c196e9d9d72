use std::{error::Error as _, process, sync::Arc};

use quire::{
    application::error::AppError,
    cache::{BlogCacheService, CacheConfig, CacheManager, InvalidationScheduler},
    config,
    infra::{
        db::PostgresRepositories,
        error::InfraError,
        http::{self, HttpState},
        telemetry,
    },
};
use sqlx::PgPool;
use tokio::runtime::Handle;
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let causes: Vec<String> = std::iter::successors(error.source(), |err| (*err).source())
        .map(ToString::to_string)
        .collect();

    if dispatcher::has_been_set() {
        error!(error = %error, ?causes, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, ?causes, "application error");
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
        config::Command::Warm(_) => run_warm(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_database(&settings).await?;
    apply_migrations(&pool).await?;
    let repositories = Arc::new(PostgresRepositories::new(pool));

    let cache_config = CacheConfig::from(&settings.cache);
    let cache = Arc::new(CacheManager::open(&cache_config).await);
    let blogs = BlogCacheService::new(cache.clone(), repositories.clone(), &cache_config);

    if cache_config.warm_on_startup {
        let report = blogs.warm_up_cache().await;
        info!(
            target = "quire::serve",
            warmed = report.warmed,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "Startup cache warm-up finished"
        );
    }

    let state = HttpState {
        invalidation: InvalidationScheduler::new(blogs.clone(), Handle::current()),
        blogs,
        writer: repositories.clone(),
        store: repositories,
    };

    let result = serve_http(&settings, state).await;
    cache.close().await;
    result
}

async fn run_warm(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_database(&settings).await?;
    let repositories = Arc::new(PostgresRepositories::new(pool));

    let cache_config = CacheConfig::from(&settings.cache);
    let cache = Arc::new(CacheManager::open(&cache_config).await);
    if !cache.is_connected() {
        warn!(
            target = "quire::warm",
            backend = cache.backend_name(),
            "Cache backend is not connected; warm-up will only read the store"
        );
    }

    let blogs = BlogCacheService::new(cache.clone(), repositories, &cache_config);
    let report = blogs.warm_up_cache().await;
    cache.close().await;

    info!(
        target = "quire::warm",
        warmed = report.warmed,
        failed = report.failed,
        elapsed_ms = report.elapsed_ms,
        "Cache warm-up finished"
    );

    if report.failed > 0 {
        return Err(AppError::unexpected(format!(
            "{} of {} warm-up queries failed",
            report.failed,
            report.failed + report.warmed
        )));
    }
    Ok(())
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let pool = connect_database(&settings).await?;
    apply_migrations(&pool).await?;
    info!(target = "quire::migrate", "Migrations applied");
    Ok(())
}

async fn connect_database(settings: &config::Settings) -> Result<PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    PostgresRepositories::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::DatabaseConnect(err)))
}

async fn apply_migrations(pool: &PgPool) -> Result<(), AppError> {
    PostgresRepositories::run_migrations(pool)
        .await
        .map_err(|err| AppError::from(InfraError::Migration(err)))
}

async fn serve_http(settings: &config::Settings, state: HttpState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let addr = settings.server.addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| AppError::from(InfraError::Bind { addr, source }))?;

    info!(
        target = "quire::serve",
        addr = %settings.server.addr,
        "Listening for HTTP requests"
    );

    let grace = settings.server.graceful_shutdown;
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    // In-flight requests get `grace` to finish once the signal arrives.
    tokio::select! {
        result = server => {
            result.map_err(|err| AppError::from(InfraError::Serve(err)))
        }
        _ = async {
            shutdown_signal().await;
            tokio::time::sleep(grace).await;
        } => {
            warn!(
                target = "quire::serve",
                grace_secs = grace.as_secs(),
                "Graceful shutdown timed out; dropping remaining connections"
            );
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(
            target = "quire::serve",
            error = %err,
            "Failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
}
