//! Entity structs for Foreman

use crate::{
    Actor, EntityIdType, PhaseId, PhaseStatus, ProjectId, ProjectStatus, TaskId, TaskPriority,
    TaskStatus, Timestamp, TokenId, TransitionId, WorkerId,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ============================================================================
// PROJECT / PHASE
// ============================================================================

/// A project owns phases, which own tasks. Created by the finalize step of an
/// Architect session, destroyed only by user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    pub description: String,
    /// Filesystem path of the working repository
    pub repo_path: String,
    pub status: ProjectStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// A phase groups tasks under one integration branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Phase {
    pub id: PhaseId,
    pub project_id: ProjectId,
    /// 1-based, unique within the project
    pub ordinal: i32,
    pub name: String,
    pub description: Option<String>,
    /// Unique within the project
    pub branch_name: String,
    pub status: PhaseStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// TASK
// ============================================================================

/// A unit of work executed by exactly one worker at a time.
///
/// `version` starts at 1 and is incremented by exactly 1 on every successful
/// mutation; every write is guarded by an `expected_version` compare-and-set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub phase_id: PhaseId,
    pub title: String,
    pub description: Option<String>,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub version: i64,
    /// Task ids in the same project this task depends on
    pub depends_on: Vec<TaskId>,
    /// Opaque prompt payload handed to the executing worker
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub worker_prompt: Option<JsonValue>,
    /// Opaque prompt payload handed to QA
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub qa_prompt: Option<JsonValue>,
    pub worker_id: Option<WorkerId>,
    pub reviewer_id: Option<WorkerId>,
    pub branch_name: Option<String>,
    pub commit_hash: Option<String>,
    #[cfg_attr(feature = "openapi", schema(value_type = Option<Object>))]
    pub qa_result: Option<JsonValue>,
    pub output_path: Option<String>,
    pub error_message: Option<String>,
    /// Id of the open assignment message, set while queued/in_progress/review
    pub assignment_message_id: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

impl Task {
    /// Construct a task fresh from decomposition. Tasks without dependencies
    /// are born `ready`; tasks with dependencies are born `waiting`.
    pub fn new_planned(
        project_id: ProjectId,
        phase_id: PhaseId,
        title: String,
        priority: TaskPriority,
        depends_on: Vec<TaskId>,
        now: Timestamp,
    ) -> Self {
        let status = if depends_on.is_empty() {
            TaskStatus::Ready
        } else {
            TaskStatus::Waiting
        };
        Self {
            id: TaskId::now_v7(),
            project_id,
            phase_id,
            title,
            description: None,
            status,
            priority,
            version: 1,
            depends_on,
            worker_prompt: None,
            qa_prompt: None,
            worker_id: None,
            reviewer_id: None,
            branch_name: None,
            commit_hash: None,
            qa_result: None,
            output_path: None,
            error_message: None,
            assignment_message_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }
}

// ============================================================================
// WORKER
// ============================================================================

/// A registered worker process. Liveness is derived, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct Worker {
    pub id: WorkerId,
    pub name: String,
    pub platform: String,
    pub executor_type: String,
    /// Declared capability set; an empty required set matches any worker
    pub capabilities: Vec<String>,
    /// SHA-256 digest of the worker secret presented on every call
    #[serde(skip_serializing, default)]
    pub secret_digest: String,
    pub current_task_id: Option<TaskId>,
    pub registered_at: Timestamp,
    pub last_heartbeat: Option<Timestamp>,
}

// ============================================================================
// REGISTRATION TOKEN
// ============================================================================

/// A single-use token consumed at worker registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct RegistrationToken {
    pub id: TokenId,
    /// SHA-256 digest of the opaque token string
    #[serde(skip_serializing, default)]
    pub token_digest: String,
    pub name: Option<String>,
    pub created_at: Timestamp,
    pub expires_at: Option<Timestamp>,
    pub revoked: bool,
    pub consumed_at: Option<Timestamp>,
}

impl RegistrationToken {
    /// Whether the token can still be consumed at `now`.
    pub fn is_usable(&self, now: Timestamp) -> bool {
        !self.revoked
            && self.consumed_at.is_none()
            && self.expires_at.map_or(true, |exp| now < exp)
    }
}

// ============================================================================
// TRANSITION RECORD
// ============================================================================

/// Append-only audit record of a committed state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
pub struct TransitionRecord {
    pub id: TransitionId,
    pub task_id: TaskId,
    pub from_status: TaskStatus,
    pub to_status: TaskStatus,
    #[cfg_attr(feature = "openapi", schema(value_type = String))]
    pub actor: Actor,
    pub reason: Option<String>,
    /// Stream message id that carried the triggering result, if any
    pub stream_message_id: Option<String>,
    pub recorded_at: Timestamp,
}
