//! OpenAPI document for the Foreman API.

use utoipa::OpenApi;

use crate::error::{ApiError, ErrorCode, ErrorEnvelope};
use crate::routes;
use crate::types::*;

/// Aggregate OpenAPI document, served at `/openapi.json`.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Foreman API",
        description = "Task-execution backbone for an LLM-driven development pipeline: \
                       dependency-aware task state machine, per-project PM orchestration, \
                       durable work streams and a realtime board.",
        version = "0.1.0",
    ),
    paths(
        routes::health::health,
        routes::workers::register_worker,
        routes::workers::worker_heartbeat,
        routes::workers::list_workers,
        routes::workers::remove_worker,
        routes::tasks::get_task,
        routes::tasks::transition_task,
        routes::pm::start_orchestration,
        routes::pm::pause_orchestration,
        routes::pm::orchestration_status,
        routes::pm::queue_next,
        routes::pm::promote_waiting,
        routes::board::get_board,
        routes::projects::create_project,
        routes::projects::list_projects,
        routes::projects::get_project,
        routes::projects::list_project_tasks,
        routes::projects::apply_plan,
        routes::tokens::create_token,
        routes::tokens::list_tokens,
        routes::tokens::revoke_token,
    ),
    components(schemas(
        ApiError,
        ErrorCode,
        ErrorEnvelope,
        RegisterWorkerRequest,
        RegisterWorkerResponse,
        HeartbeatRequest,
        HeartbeatResponse,
        HeartbeatDirective,
        WorkerView,
        TransitionTaskRequest,
        TransitionTaskResponse,
        TaskDetailResponse,
        CreateProjectRequest,
        ProjectDetailResponse,
        PhaseSummary,
        PlanAppliedResponse,
        PmStatusResponse,
        WorkerCounts,
        QueueNextResponse,
        PromotedResponse,
        BoardResponse,
        CreateTokenRequest,
        CreateTokenResponse,
        TokenView,
        AssignmentMessage,
        ResultMessage,
        ControlMessage,
        foreman_core::Project,
        foreman_core::Phase,
        foreman_core::Task,
        foreman_core::TransitionRecord,
        foreman_core::TaskStatus,
        foreman_core::TaskPriority,
        foreman_core::ProjectStatus,
        foreman_core::PhaseStatus,
        foreman_core::WorkerStatus,
        foreman_core::ResultKind,
        foreman_store::ProjectPlan,
        foreman_store::PlanPhase,
        foreman_store::PlanTask,
        crate::routes::health::HealthResponse,
    )),
    tags(
        (name = "Workers", description = "Worker registration, heartbeats and liveness"),
        (name = "Tasks", description = "Task state machine surface"),
        (name = "PM", description = "Per-project orchestration control"),
        (name = "Board", description = "Kanban board snapshots and realtime events"),
        (name = "Projects", description = "Projects, phases and decomposition plans"),
        (name = "Tokens", description = "Registration token administration"),
        (name = "Health", description = "Probes"),
    )
)]
pub struct ApiDoc;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_document_builds() {
        let doc = ApiDoc::openapi();
        let json = serde_json::to_string(&doc).expect("document serializes");
        assert!(json.contains("/api/v1/workers/register"));
        assert!(json.contains("/api/v1/tasks/{id}/transition"));
        assert!(json.contains("/api/v1/board/{project_id}"));
    }
}
