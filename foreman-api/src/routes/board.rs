//! Board REST + WebSocket Routes

use axum::{
    extract::{Path, State},
    Json,
};
use foreman_core::{ProjectId, Task, TaskStatus, WorkerStatus};
use std::collections::HashMap;

use crate::error::{ApiError, ApiResult, ErrorEnvelope};
use crate::state::AppState;
use crate::types::{BoardResponse, WorkerCounts};
use crate::ws::board_ws_handler;

/// GET /api/v1/board/{project_id} - Full board snapshot
#[utoipa::path(
    get,
    path = "/api/v1/board/{project_id}",
    tag = "Board",
    params(("project_id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Board snapshot", body = BoardResponse),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
    )
)]
pub async fn get_board(
    State(state): State<AppState>,
    Path(project_id): Path<ProjectId>,
) -> ApiResult<Json<BoardResponse>> {
    state
        .store
        .get_project(project_id)
        .await?
        .ok_or_else(|| ApiError::not_found("project", project_id))?;

    let tasks = state.store.list_tasks(project_id, None).await?;
    let mut columns: HashMap<TaskStatus, Vec<Task>> = TaskStatus::ALL
        .iter()
        .map(|status| (*status, Vec::new()))
        .collect();
    for task in tasks {
        columns.entry(task.status).or_default().push(task);
    }

    let mut stats: HashMap<TaskStatus, i64> = TaskStatus::ALL
        .iter()
        .map(|status| (*status, 0))
        .collect();
    for (status, count) in state.store.count_tasks_by_status(project_id).await? {
        stats.insert(status, count);
    }
    let total = stats.values().sum();

    let mut workers = WorkerCounts::default();
    for (_, status) in state.registry.list_classified().await? {
        workers.total += 1;
        match status {
            WorkerStatus::Idle => workers.idle += 1,
            WorkerStatus::Busy => workers.busy += 1,
            WorkerStatus::Offline => workers.offline += 1,
        }
    }

    Ok(Json(BoardResponse {
        project_id,
        columns,
        stats,
        total,
        workers,
    }))
}

/// Create the board routes router.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/:project_id", axum::routing::get(get_board))
        .route("/:project_id/ws", axum::routing::get(board_ws_handler))
        .with_state(state)
}
