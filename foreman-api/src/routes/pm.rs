//! PM Orchestrator REST API Routes

use axum::{
    extract::{Path, State},
    Json,
};
use foreman_core::ProjectId;

use crate::error::{ApiError, ApiResult, ErrorEnvelope};
use crate::state::AppState;
use crate::types::{PmStatusResponse, PromotedResponse, QueueNextResponse};

/// POST /api/v1/pm/{project_id}/start - Start orchestration
#[utoipa::path(
    post,
    path = "/api/v1/pm/{project_id}/start",
    tag = "PM",
    params(("project_id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Orchestration running", body = PmStatusResponse),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
        (status = 409, description = "Design not finalized", body = ErrorEnvelope),
    )
)]
pub async fn start_orchestration(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<PmStatusResponse>> {
    state.pm.start(project_id).await?;
    Ok(Json(state.pm.status(project_id).await?))
}

/// POST /api/v1/pm/{project_id}/pause - Pause orchestration
#[utoipa::path(
    post,
    path = "/api/v1/pm/{project_id}/pause",
    tag = "PM",
    params(("project_id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Orchestration paused", body = PmStatusResponse),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
    )
)]
pub async fn pause_orchestration(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<PmStatusResponse>> {
    state.pm.pause(project_id).await?;
    Ok(Json(state.pm.status(project_id).await?))
}

/// GET /api/v1/pm/{project_id}/status - Orchestration status
#[utoipa::path(
    get,
    path = "/api/v1/pm/{project_id}/status",
    tag = "PM",
    params(("project_id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Current status", body = PmStatusResponse),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
    )
)]
pub async fn orchestration_status(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<PmStatusResponse>> {
    Ok(Json(state.pm.status(project_id).await?))
}

/// POST /api/v1/pm/{project_id}/queue-next - One-shot dispatch
#[utoipa::path(
    post,
    path = "/api/v1/pm/{project_id}/queue-next",
    tag = "PM",
    params(("project_id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Task queued", body = QueueNextResponse),
        (status = 404, description = "No ready task could be dispatched", body = ErrorEnvelope),
    )
)]
pub async fn queue_next(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<QueueNextResponse>> {
    match state.pm.queue_next(project_id).await? {
        Some(task) => Ok(Json(QueueNextResponse {
            task_id: task.id,
            title: task.title,
            status: task.status,
        })),
        None => Err(ApiError::new(
            crate::error::ErrorCode::EntityNotFound,
            "No ready tasks to queue",
        )),
    }
}

/// POST /api/v1/pm/{project_id}/promote-waiting - Readiness sweep
#[utoipa::path(
    post,
    path = "/api/v1/pm/{project_id}/promote-waiting",
    tag = "PM",
    params(("project_id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Promoted tasks", body = PromotedResponse),
    )
)]
pub async fn promote_waiting(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<PromotedResponse>> {
    let promoted = state.pm.promote_waiting(project_id).await?;
    Ok(Json(PromotedResponse {
        promoted: promoted.into_iter().map(|t| t.id).collect(),
    }))
}

/// Create the PM routes router.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/:project_id/start", axum::routing::post(start_orchestration))
        .route("/:project_id/pause", axum::routing::post(pause_orchestration))
        .route("/:project_id/status", axum::routing::get(orchestration_status))
        .route("/:project_id/queue-next", axum::routing::post(queue_next))
        .route(
            "/:project_id/promote-waiting",
            axum::routing::post(promote_waiting),
        )
        .with_state(state)
}
