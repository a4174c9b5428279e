//! Worker REST API Routes

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use foreman_core::WorkerId;
use foreman_queue::{control_stream, RESULTS_STREAM};
use serde::Deserialize;

use crate::error::{ApiError, ApiResult, ErrorEnvelope};
use crate::state::AppState;
use crate::types::{
    HeartbeatRequest, HeartbeatResponse, RegisterWorkerRequest, RegisterWorkerResponse,
    WorkerView,
};

/// POST /api/v1/workers/register - Register a worker with a one-time token
#[utoipa::path(
    post,
    path = "/api/v1/workers/register",
    tag = "Workers",
    request_body = RegisterWorkerRequest,
    responses(
        (status = 201, description = "Worker registered; the secret is returned once", body = RegisterWorkerResponse),
        (status = 400, description = "Invalid request", body = ErrorEnvelope),
        (status = 401, description = "Token unknown, used, expired or revoked", body = ErrorEnvelope),
    )
)]
pub async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterWorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.token.trim().is_empty() {
        return Err(ApiError::missing_field("token"));
    }
    if req.platform.trim().is_empty() {
        return Err(ApiError::missing_field("platform"));
    }

    let registered = state
        .registry
        .register(
            &req.token,
            req.name,
            req.platform,
            req.capabilities,
            req.executor_type,
        )
        .await?;

    let response = RegisterWorkerResponse {
        worker_id: registered.worker.id,
        worker_secret: registered.worker_secret,
        heartbeat_interval_secs: state.config.heartbeat_interval.as_secs(),
        results_stream: RESULTS_STREAM.to_string(),
        control_stream: control_stream(registered.worker.id),
    };
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /api/v1/workers/{id}/heartbeat - Record a heartbeat
#[utoipa::path(
    post,
    path = "/api/v1/workers/{id}/heartbeat",
    tag = "Workers",
    params(("id" = WorkerId, Path, description = "Worker ID")),
    request_body = HeartbeatRequest,
    responses(
        (status = 200, description = "Heartbeat recorded", body = HeartbeatResponse),
        (status = 401, description = "Secret does not match", body = ErrorEnvelope),
        (status = 404, description = "Worker not found", body = ErrorEnvelope),
    )
)]
pub async fn worker_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
    Json(req): Json<HeartbeatRequest>,
) -> ApiResult<Json<HeartbeatResponse>> {
    let reply = state.registry.heartbeat(id, &req.worker_secret).await?;
    Ok(Json(reply))
}

/// GET /api/v1/workers - List workers with derived liveness
#[utoipa::path(
    get,
    path = "/api/v1/workers",
    tag = "Workers",
    responses(
        (status = 200, description = "All known workers", body = [WorkerView]),
    )
)]
pub async fn list_workers(State(state): State<AppState>) -> ApiResult<Json<Vec<WorkerView>>> {
    let classified = state.registry.list_classified().await?;
    let views = classified
        .iter()
        .map(|(worker, status)| WorkerView::from_worker(worker, *status))
        .collect();
    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
pub struct RemoveWorkerParams {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /api/v1/workers/{id} - Administratively remove a worker
#[utoipa::path(
    delete,
    path = "/api/v1/workers/{id}",
    tag = "Workers",
    params(
        ("id" = WorkerId, Path, description = "Worker ID"),
        ("force" = Option<bool>, Query, description = "Remove even while executing"),
    ),
    responses(
        (status = 204, description = "Worker removed"),
        (status = 404, description = "Worker not found", body = ErrorEnvelope),
        (status = 409, description = "Worker is executing a task", body = ErrorEnvelope),
    )
)]
pub async fn remove_worker(
    State(state): State<AppState>,
    Path(id): Path<WorkerId>,
    Query(params): Query<RemoveWorkerParams>,
) -> ApiResult<StatusCode> {
    let removed = state.registry.remove(id, params.force).await?;
    if !removed {
        return Err(ApiError::not_found("worker", id));
    }
    Ok(StatusCode::NO_CONTENT)
}

/// Create the worker routes router.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/register", axum::routing::post(register_worker))
        .route("/:id/heartbeat", axum::routing::post(worker_heartbeat))
        .route("/", axum::routing::get(list_workers))
        .route("/:id", axum::routing::delete(remove_worker))
        .with_state(state)
}
