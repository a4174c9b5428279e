//! Shared application state for Axum routers.

use crate::config::ApiConfig;
use crate::events::BoardBus;
use crate::registry::WorkerRegistry;
use crate::services::PmSupervisor;
use foreman_queue::StreamQueue;
use foreman_store::Store;
use std::sync::Arc;
use std::time::Instant;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn StreamQueue>,
    pub registry: Arc<WorkerRegistry>,
    pub bus: Arc<BoardBus>,
    pub pm: Arc<PmSupervisor>,
    pub config: ApiConfig,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn StreamQueue>,
        registry: Arc<WorkerRegistry>,
        bus: Arc<BoardBus>,
        pm: Arc<PmSupervisor>,
        config: ApiConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            bus,
            pm,
            config,
            start_time: Instant::now(),
        }
    }
}
