/// Server setup and initialization
///
/// Wires together all components: storage, execution log, definition cache,
/// action registry, runner, scheduler and HTTP routes.

use crate::{
    api::{create_log_routes, create_webhook_routes, create_workflow_routes, AppState},
    config::Config,
    logs::{ExecutionLogSink, SqliteLogSink, ORPHANED_RUN_MESSAGE},
    runtime::{ActionRegistry, RetryPolicy, WorkflowRunner, WorkflowScheduler},
    workflow::{CachedDefinitions, WorkflowStore},
};
use anyhow::{Context, Result};
use axum::{routing::get, Router};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::{path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Open (and create if needed) the SQLite database behind `url`
pub async fn connect_database(url: &str) -> Result<SqlitePool> {
    ensure_database_dir(url)?;

    let options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("invalid database url: {url}"))?
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("failed to open database: {url}"))?;

    Ok(pool)
}

/// Create the parent directory of a file-backed database
fn ensure_database_dir(url: &str) -> Result<()> {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.starts_with(":memory:") {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        tracing::info!("📁 Ensuring data directory exists: {}", parent.display());
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create data directory {}", parent.display()))?;
    }
    Ok(())
}

/// Build every engine component on top of `pool`, reconcile stored cron
/// workflows and start the scheduler.
pub async fn build_state(config: &Config, pool: SqlitePool) -> Result<AppState> {
    tracing::info!("📋 Initializing workflow storage");
    let store = WorkflowStore::new(pool.clone());
    store.init_schema().await.context("failed to create workflow schema")?;

    tracing::info!("📜 Initializing execution log");
    let logs = Arc::new(SqliteLogSink::new(pool));
    logs.init_schema().await.context("failed to create execution log schema")?;
    logs.fail_orphaned_runs(ORPHANED_RUN_MESSAGE)
        .await
        .context("failed to close orphaned runs")?;

    let cache = Arc::new(CachedDefinitions::new(
        Arc::new(store.clone()),
        Duration::from_secs(config.cache.ttl_secs),
    ));

    tracing::info!("⚙️ Initializing action registry and runner");
    let registry = Arc::new(ActionRegistry::with_builtins(&config.actions));
    let runner = Arc::new(WorkflowRunner::new(
        registry,
        RetryPolicy::from(&config.retry),
        CancellationToken::new(),
    ));

    tracing::info!("⏰ Initializing workflow scheduler");
    let scheduler = Arc::new(
        WorkflowScheduler::new(cache.clone(), runner, logs, config.scheduler.clone())
            .await
            .context("failed to initialize scheduler")?,
    );

    let active = store.list_active().await.context("failed to load active workflows")?;
    scheduler
        .reconcile_on_startup(&active)
        .await
        .context("failed to reconcile schedules")?;
    scheduler.start().await.context("failed to start scheduler")?;

    Ok(AppState {
        store,
        cache,
        scheduler,
    })
}

/// Create the Axum router over an already-built state
pub fn create_app(state: AppState) -> Router {
    Router::new()
        // Health check endpoint
        .route("/healthz", get(health_check))
        .merge(create_workflow_routes())
        .merge(create_webhook_routes())
        .merge(create_log_routes())
        .with_state(state)
}

/// Start the HTTP server with the given configuration
///
/// Serves until Ctrl-C, then drains the scheduler within its grace period.
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting flowpilot server...");

    let pool = connect_database(&config.database.url).await?;
    let state = build_state(&config, pool).await?;
    let scheduler = Arc::clone(&state.scheduler);
    let app = create_app(state);

    // Bind to the configured address
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await?;
    tracing::info!("👋 flowpilot stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("❌ Failed to listen for Ctrl-C: {}", e);
        // Without a signal handler, keep serving until the process is killed.
        std::future::pending::<()>().await;
    }
    tracing::info!("🛑 Shutdown signal received");
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_databases_need_no_directory() {
        ensure_database_dir("sqlite::memory:").unwrap();
        ensure_database_dir("sqlite://flowpilot.db").unwrap();
    }
}
