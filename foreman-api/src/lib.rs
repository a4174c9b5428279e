//! Foreman API - REST/WebSocket layer and orchestration runtime
//!
//! This crate hosts the HTTP surface (Axum) plus the runtime services that
//! drive the task-execution backbone: the worker registry, the per-project
//! PM orchestration loops, the dispatcher, the result ingester and the
//! pending-results janitor. Realtime board updates fan out over WebSocket.

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod jobs;
pub mod openapi;
pub mod registry;
pub mod routes;
pub mod services;
pub mod state;
pub mod types;
pub mod ws;

// Re-export commonly used types
pub use config::{ApiConfig, OrchestratorConfig};
pub use error::{ApiError, ApiResult, ErrorCode, ErrorEnvelope};
pub use events::{BoardBus, BoardEvent};
pub use jobs::{janitor_task, JanitorConfig, JanitorMetrics};
pub use openapi::ApiDoc;
pub use registry::{Registered, WorkerRegistry};
pub use routes::create_api_router;
pub use services::{DispatchOutcome, Dispatcher, IngestOutcome, PmSupervisor, ResultIngester};
pub use state::AppState;
