//! Project REST API Routes
//!
//! Projects are created in `design`; applying a decomposition plan
//! finalizes the design and parks the project in `paused`, from where the
//! PM can start it.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use foreman_core::{Project, ProjectId, ProjectStatus, Task, TaskStatus};
use foreman_store::ProjectPlan;
use serde::Deserialize;

use crate::error::{ApiError, ApiResult, ErrorEnvelope};
use crate::state::AppState;
use crate::types::{
    CreateProjectRequest, PhaseSummary, PlanAppliedResponse, ProjectDetailResponse,
};

/// POST /api/v1/projects - Create a project in design state
#[utoipa::path(
    post,
    path = "/api/v1/projects",
    tag = "Projects",
    request_body = CreateProjectRequest,
    responses(
        (status = 201, description = "Project created", body = Project),
        (status = 400, description = "Invalid request", body = ErrorEnvelope),
    )
)]
pub async fn create_project(
    State(state): State<AppState>,
    Json(req): Json<CreateProjectRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() {
        return Err(ApiError::missing_field("name"));
    }
    if req.repo_path.trim().is_empty() {
        return Err(ApiError::missing_field("repo_path"));
    }
    let project = state
        .store
        .create_project(&req.name, &req.description, &req.repo_path)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// GET /api/v1/projects - List projects
#[utoipa::path(
    get,
    path = "/api/v1/projects",
    tag = "Projects",
    responses((status = 200, description = "All projects", body = [Project]))
)]
pub async fn list_projects(State(state): State<AppState>) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.store.list_projects().await?))
}

/// GET /api/v1/projects/{id} - Project with phase summaries
#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}",
    tag = "Projects",
    params(("id" = ProjectId, Path, description = "Project ID")),
    responses(
        (status = 200, description = "Project detail", body = ProjectDetailResponse),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
    )
)]
pub async fn get_project(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
) -> ApiResult<Json<ProjectDetailResponse>> {
    let project = state
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| ApiError::not_found("project", id))?;
    let phases = state
        .store
        .list_phases(id)
        .await?
        .into_iter()
        .map(|p| PhaseSummary {
            id: p.id,
            ordinal: p.ordinal,
            name: p.name,
            branch_name: p.branch_name,
            status: p.status,
        })
        .collect();
    Ok(Json(ProjectDetailResponse { project, phases }))
}

#[derive(Debug, Deserialize)]
pub struct ListTasksParams {
    /// Optional status filter
    pub status: Option<TaskStatus>,
}

/// GET /api/v1/projects/{id}/tasks - Tasks of a project
#[utoipa::path(
    get,
    path = "/api/v1/projects/{id}/tasks",
    tag = "Projects",
    params(
        ("id" = ProjectId, Path, description = "Project ID"),
        ("status" = Option<String>, Query, description = "Filter by task status"),
    ),
    responses(
        (status = 200, description = "Tasks", body = [Task]),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
    )
)]
pub async fn list_project_tasks(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
    Query(params): Query<ListTasksParams>,
) -> ApiResult<Json<Vec<Task>>> {
    state
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| ApiError::not_found("project", id))?;
    let filter = params.status.map(|s| vec![s]);
    let tasks = state.store.list_tasks(id, filter.as_deref()).await?;
    Ok(Json(tasks))
}

/// POST /api/v1/projects/{id}/plan - Apply a decomposition plan
#[utoipa::path(
    post,
    path = "/api/v1/projects/{id}/plan",
    tag = "Projects",
    params(("id" = ProjectId, Path, description = "Project ID")),
    request_body = ProjectPlan,
    responses(
        (status = 201, description = "Plan persisted as a unit", body = PlanAppliedResponse),
        (status = 400, description = "Cycle, dangling reference or duplicate", body = ErrorEnvelope),
        (status = 404, description = "Project not found", body = ErrorEnvelope),
        (status = 409, description = "Project already has a plan", body = ErrorEnvelope),
    )
)]
pub async fn apply_plan(
    State(state): State<AppState>,
    Path(id): Path<ProjectId>,
    Json(plan): Json<ProjectPlan>,
) -> ApiResult<impl IntoResponse> {
    let project = state
        .store
        .get_project(id)
        .await?
        .ok_or_else(|| ApiError::not_found("project", id))?;
    if project.status != ProjectStatus::Design {
        return Err(ApiError::state_conflict(
            "Project design is already finalized",
        ));
    }

    let (phases, tasks) = state.store.apply_plan(id, &plan).await?;
    // Finalized: the project can now be started.
    state
        .store
        .set_project_status(id, ProjectStatus::Paused)
        .await?;

    let ready = tasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .count();
    Ok((
        StatusCode::CREATED,
        Json(PlanAppliedResponse {
            project_id: id,
            phases: phases.len(),
            tasks: tasks.len(),
            ready,
        }),
    ))
}

/// Create the project routes router.
pub fn create_router(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/", axum::routing::post(create_project))
        .route("/", axum::routing::get(list_projects))
        .route("/:id", axum::routing::get(get_project))
        .route("/:id/tasks", axum::routing::get(list_project_tasks))
        .route("/:id/plan", axum::routing::post(apply_plan))
        .with_state(state)
}
