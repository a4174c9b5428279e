//! Foreman API Server Entry Point
//!
//! Bootstraps configuration, connects the store and the stream queue,
//! spawns the background consumers, and serves the Axum router.

use std::net::SocketAddr;
use std::sync::Arc;

use foreman_api::{
    create_api_router, janitor_task, ApiConfig, ApiError, ApiResult, AppState, BoardBus,
    JanitorConfig, OrchestratorConfig, PmSupervisor, ResultIngester, WorkerRegistry,
};
use foreman_api::constants::DEFAULT_INGEST_RETRIES;
use foreman_queue::{GroupStart, PgQueueConfig, PgStreamQueue, StreamQueue, GROUP_INGESTERS, RESULTS_STREAM};
use foreman_store::{DbConfig, PgStore, Store};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("foreman_api=info,tower_http=info,info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db_config = DbConfig::from_env();
    let store: Arc<dyn Store> =
        Arc::new(PgStore::from_config(&db_config).map_err(ApiError::from)?);

    let queue_config = PgQueueConfig::from_env();
    let queue: Arc<dyn StreamQueue> =
        Arc::new(PgStreamQueue::from_config(&queue_config).map_err(ApiError::from)?);
    queue
        .ensure_group(RESULTS_STREAM, GROUP_INGESTERS, GroupStart::Beginning)
        .await
        .map_err(ApiError::from)?;

    let api_config = ApiConfig::from_env();
    let registry = Arc::new(WorkerRegistry::new(
        store.clone(),
        api_config.heartbeat_interval,
    ));
    let bus = Arc::new(BoardBus::new(api_config.board_buffer));

    let pm = Arc::new(PmSupervisor::new(
        store.clone(),
        queue.clone(),
        registry.clone(),
        bus.clone(),
        OrchestratorConfig::from_env(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let ingester = Arc::new(
        ResultIngester::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            bus.clone(),
            DEFAULT_INGEST_RETRIES,
        )
        .with_supervisor(pm.clone()),
    );
    let ingester_handle = tokio::spawn(
        ingester
            .clone()
            .run("ingester-0".to_string(), shutdown_rx.clone()),
    );

    let janitor_handle = tokio::spawn(janitor_task(
        queue.clone(),
        ingester.clone(),
        JanitorConfig::from_env(),
        shutdown_rx.clone(),
    ));

    let state = AppState::new(store, queue, registry, bus, pm, api_config.clone());
    let app = create_api_router(state)?;

    let addr: SocketAddr = format!("{}:{}", api_config.bind, api_config.port)
        .parse()
        .map_err(|e| ApiError::invalid_input(format!("Invalid bind address: {}", e)))?;
    tracing::info!(%addr, "Starting Foreman API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = ingester_handle.await;
    let _ = janitor_handle.await;
    Ok(())
}
