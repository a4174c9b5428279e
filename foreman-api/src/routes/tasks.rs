//! Task REST API Routes
//!
//! The transition endpoint is the administrative entry into the state
//! machine: retry (`rejected -> ready`), block/unblock, and cancellation.
//! Worker-driven transitions arrive through the result stream instead.

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use foreman_core::{Actor, TaskId, TaskStatus};
use foreman_queue::control_stream;
use foreman_state::{plan_transition, TransitionEffects, TransitionInput};
use foreman_store::CasOutcome;

use crate::error::{ApiError, ApiResult, ErrorEnvelope};
use crate::events::BoardEvent;
use crate::state::AppState;
use crate::types::{ControlMessage, TaskDetailResponse, TransitionTaskRequest, TransitionTaskResponse};

/// GET /api/v1/tasks/{id} - Task with dependencies and history
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    tag = "Tasks",
    params(("id" = TaskId, Path, description = "Task ID")),
    responses(
        (status = 200, description = "Task detail", body = TaskDetailResponse),
        (status = 404, description = "Task not found", body = ErrorEnvelope),
    )
)]
pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task", id))?;
    let history = state.store.list_transitions(id).await?;
    Ok(Json(TaskDetailResponse { task, history }))
}

/// POST /api/v1/tasks/{id}/transition - Apply an administrative transition
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/transition",
    tag = "Tasks",
    params(("id" = TaskId, Path, description = "Task ID")),
    request_body = TransitionTaskRequest,
    responses(
        (status = 200, description = "Transition applied", body = TransitionTaskResponse),
        (status = 404, description = "Task not found", body = ErrorEnvelope),
        (status = 409, description = "Version conflict or illegal transition", body = ErrorEnvelope),
        (status = 412, description = "Dependency or prerequisite not satisfied", body = ErrorEnvelope),
    )
)]
pub async fn transition_task(
    State(state): State<AppState>,
    Path(id): Path<TaskId>,
    Json(req): Json<TransitionTaskRequest>,
) -> ApiResult<Json<TransitionTaskResponse>> {
    let actor: Actor = req
        .actor
        .parse()
        .map_err(|_| ApiError::invalid_input(format!("Unknown actor '{}'", req.actor)))?;

    let task = state
        .store
        .get_task(id)
        .await?
        .ok_or_else(|| ApiError::not_found("task", id))?;
    let previous_status = task.status;

    // Cancellation path: tell the executing worker to stop before the state
    // flips under it. The control message is advisory; the version check
    // decides who wins if a result is already in flight.
    if req.new_status == TaskStatus::Rejected {
        if let Some(worker_id) = task.worker_id {
            let cancel = serde_json::to_value(ControlMessage::Cancel { task_id: id })
                .map_err(|e| ApiError::internal_error(e.to_string()))?;
            if let Err(err) = state.queue.publish(&control_stream(worker_id), &cancel).await {
                tracing::warn!(task_id = %id, worker_id = %worker_id, error = %err,
                    "Cancel control message not published");
            }
        }
    }

    let dependencies = if req.new_status == TaskStatus::Ready {
        state.store.dependency_statuses(id).await?
    } else {
        Vec::new()
    };

    let effects = match req.new_status {
        TaskStatus::Rejected => TransitionEffects {
            error_message: req.reason.clone(),
            ..Default::default()
        },
        _ => TransitionEffects::default(),
    };

    let staged = plan_transition(TransitionInput {
        task: &task,
        to: req.new_status,
        actor,
        reason: req.reason.clone(),
        expected_version: req.expected_version,
        dependencies: &dependencies,
        stream_message_id: None,
        effects,
        now: Utc::now(),
    })
    .map_err(ApiError::from)?;

    match state
        .store
        .apply_transition(&staged.task, &staged.record)
        .await?
    {
        CasOutcome::Applied => {}
        CasOutcome::VersionMismatch { actual } => {
            return Err(ApiError::new(
                crate::error::ErrorCode::VersionConflict,
                format!("Expected version {}, found {}", req.expected_version, actual),
            )
            .with_task(id)
            .with_versions(req.expected_version, actual));
        }
        CasOutcome::NotFound => return Err(ApiError::not_found("task", id)),
    }

    // Rejecting frees the worker attribution.
    if staged.task.status == TaskStatus::Rejected {
        if let Some(worker_id) = task.worker_id {
            state.registry.set_current_task(worker_id, None).await?;
        }
    }

    state.bus.publish(
        staged.task.project_id,
        BoardEvent::task_moved(id, previous_status, staged.task.status),
    );
    // Retry and unblock add dispatchable work; wake the loop.
    if matches!(staged.task.status, TaskStatus::Ready | TaskStatus::Rejected) {
        state.pm.wake(staged.task.project_id);
    }

    Ok(Json(TransitionTaskResponse {
        task_id: id,
        status: staged.task.status,
        previous_status,
        version: staged.task.version,
    }))
}

/// Create the task routes router.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/:id", axum::routing::get(get_task))
        .route("/:id/transition", axum::routing::post(transition_task))
        .with_state(state)
}
