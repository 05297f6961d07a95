//! Orchestrator entrypoint: loads configuration, migrates the database,
//! wires the dispatch/scheduler pipeline, and serves the public API.

use std::sync::Arc;

use orchestrator_core::api::{build_router, AppState};
use orchestrator_core::config::Config;
use orchestrator_core::dispatcher::{Dispatcher, DispatcherConfig};
use orchestrator_core::persistence::PgPersistence;
use orchestrator_core::reporter::Reporter;
use orchestrator_core::scheduler::Scheduler;
use orchestrator_core::worker_directory::WorkerDirectory;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,orchestrator_core=debug,sqlx=warn")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store: Arc<dyn orchestrator_core::persistence::PersistenceLayer> =
        Arc::new(PgPersistence::new(pool));

    let directory = Arc::new(WorkerDirectory::new(
        config.worker_endpoints.clone(),
        std::time::Duration::from_secs(2),
    ));
    let reporter = Arc::new(Reporter::new(config.callback_endpoint.clone(), config.callback_timeout));

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        directory.clone(),
        reporter.clone(),
        DispatcherConfig {
            max_workers: config.max_workers,
            batch_size: config.batch_size,
            worker_timeout: config.worker_timeout,
            max_retry_attempts: config.max_retry_attempts,
            retry_delay: config.retry_delay,
        },
    ));

    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        store.clone(),
        dispatcher.clone(),
        directory.clone(),
    ));
    scheduler.start().await?;

    let state = AppState { store, dispatcher, scheduler, reporter };
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    tracing::info!(%addr, "orchestrator listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
