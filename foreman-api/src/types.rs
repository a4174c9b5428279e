//! Request, response and wire message types.

use chrono::{DateTime, Utc};
use foreman_core::{
    PhaseId, ProjectId, ResultKind, Task, TaskId, TaskStatus, Worker, WorkerId, WorkerStatus,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;

// ============================================================================
// WORKER REGISTRATION / HEARTBEAT
// ============================================================================

/// Body of `POST /api/v1/workers/register`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RegisterWorkerRequest {
    /// Single-use registration token issued by an operator
    pub token: String,
    #[serde(default)]
    pub name: Option<String>,
    pub platform: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_executor")]
    pub executor_type: String,
}

fn default_executor() -> String {
    "claude-code".to_string()
}

/// The worker secret is returned exactly once, here.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct RegisterWorkerResponse {
    pub worker_id: WorkerId,
    pub worker_secret: String,
    pub heartbeat_interval_secs: u64,
    /// Stream the worker consumes assignments from, per project
    pub results_stream: String,
    pub control_stream: String,
}

/// Body of `POST /api/v1/workers/{id}/heartbeat`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct HeartbeatRequest {
    pub worker_secret: String,
}

/// Directive carried back on a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum HeartbeatDirective {
    /// The worker's current task was cancelled externally; stop and discard
    Drain,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct HeartbeatResponse {
    pub status: WorkerStatus,
    pub pending_tasks: usize,
    pub current_task_id: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directive: Option<HeartbeatDirective>,
}

/// Worker as presented over the API: derived status, no secret material.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkerView {
    pub id: WorkerId,
    pub name: String,
    pub platform: String,
    pub executor_type: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub current_task_id: Option<TaskId>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl WorkerView {
    pub fn from_worker(worker: &Worker, status: WorkerStatus) -> Self {
        Self {
            id: worker.id,
            name: worker.name.clone(),
            platform: worker.platform.clone(),
            executor_type: worker.executor_type.clone(),
            capabilities: worker.capabilities.clone(),
            status,
            current_task_id: worker.current_task_id,
            registered_at: worker.registered_at,
            last_heartbeat: worker.last_heartbeat,
        }
    }
}

// ============================================================================
// TASK TRANSITIONS
// ============================================================================

/// Body of `POST /api/v1/tasks/{id}/transition`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TransitionTaskRequest {
    pub new_status: TaskStatus,
    /// "pm" | "worker:<id>" | "user" | "system"
    pub actor: String,
    pub expected_version: i64,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TransitionTaskResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub previous_status: TaskStatus,
    pub version: i64,
}

/// Task plus its transition history.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TaskDetailResponse {
    #[serde(flatten)]
    pub task: Task,
    pub history: Vec<foreman_core::TransitionRecord>,
}

// ============================================================================
// PROJECTS / PM
// ============================================================================

/// Body of `POST /api/v1/projects`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateProjectRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub repo_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PlanAppliedResponse {
    pub project_id: ProjectId,
    pub phases: usize,
    pub tasks: usize,
    pub ready: usize,
}

/// Worker liveness counts for PM status and the board.
#[derive(Debug, Clone, Default, Serialize, Deserialize, utoipa::ToSchema)]
pub struct WorkerCounts {
    pub idle: usize,
    pub busy: usize,
    pub offline: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PmStatusResponse {
    pub project_id: ProjectId,
    pub running: bool,
    pub workers: WorkerCounts,
    pub tasks: HashMap<TaskStatus, i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct QueueNextResponse {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PromotedResponse {
    pub promoted: Vec<TaskId>,
}

// ============================================================================
// BOARD
// ============================================================================

/// Snapshot of a project's kanban board.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct BoardResponse {
    pub project_id: ProjectId,
    /// Tasks grouped by status column
    pub columns: HashMap<TaskStatus, Vec<Task>>,
    /// Task counts per status plus a "total"
    pub stats: HashMap<TaskStatus, i64>,
    pub total: i64,
    pub workers: WorkerCounts,
}

// ============================================================================
// REGISTRATION TOKENS
// ============================================================================

/// Body of `POST /api/v1/tokens`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateTokenRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// Optional expiry, absolute
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

/// The opaque token string is returned exactly once, here.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct CreateTokenResponse {
    pub token_id: foreman_core::TokenId,
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Token metadata as listed; never includes token material.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TokenView {
    pub id: foreman_core::TokenId,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub consumed: bool,
}

// ============================================================================
// WIRE MESSAGES
// ============================================================================

/// Assignment record published on `tasks:assign:<project_id>`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct AssignmentMessage {
    pub task_id: TaskId,
    pub project_id: ProjectId,
    pub worker_id: WorkerId,
    pub assigned_at: DateTime<Utc>,
    pub branch_name: Option<String>,
    #[schema(value_type = Option<Object>)]
    pub worker_prompt: Option<JsonValue>,
    #[schema(value_type = Option<Object>)]
    pub qa_prompt: Option<JsonValue>,
    pub expected_version: i64,
}

/// Result record consumed from `tasks:results`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ResultMessage {
    pub task_id: TaskId,
    pub worker_id: WorkerId,
    pub worker_secret: String,
    pub kind: ResultKind,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: JsonValue,
    pub expected_version: i64,
    pub ts: DateTime<Utc>,
}

impl ResultMessage {
    /// `payload.{field}` as a string, if present.
    pub fn payload_str(&self, field: &str) -> Option<String> {
        self.payload
            .get(field)
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

/// Control record published on `workers:control:<worker_id>`.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Stop work on the named task and discard local state
    Cancel { task_id: TaskId },
    /// Finish the current task, then stop pulling assignments
    Drain,
}

// ============================================================================
// PHASE VIEW
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ProjectDetailResponse {
    #[serde(flatten)]
    pub project: foreman_core::Project,
    pub phases: Vec<PhaseSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct PhaseSummary {
    pub id: PhaseId,
    pub ordinal: i32,
    pub name: String,
    pub branch_name: String,
    pub status: foreman_core::PhaseStatus,
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::EntityIdType;
    use serde_json::json;

    #[test]
    fn test_result_message_round_trip() {
        let msg = ResultMessage {
            task_id: TaskId::now_v7(),
            worker_id: WorkerId::now_v7(),
            worker_secret: "s".repeat(64),
            kind: ResultKind::Submitted,
            payload: json!({
                "commit_hash": "abc123",
                "branch_name": "task/x",
                "output_path": "out/x"
            }),
            expected_version: 3,
            ts: Utc::now(),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["kind"], "submitted");
        let parsed: ResultMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed.payload_str("commit_hash").as_deref(), Some("abc123"));
        assert_eq!(parsed.expected_version, 3);
    }

    #[test]
    fn test_control_message_tagging() {
        let cancel = ControlMessage::Cancel {
            task_id: TaskId::nil(),
        };
        let wire = serde_json::to_value(&cancel).unwrap();
        assert_eq!(wire["op"], "cancel");
    }

    #[test]
    fn test_register_request_defaults() {
        let parsed: RegisterWorkerRequest = serde_json::from_value(json!({
            "token": "t",
            "platform": "linux"
        }))
        .unwrap();
        assert_eq!(parsed.executor_type, "claude-code");
        assert!(parsed.capabilities.is_empty());
    }
}
