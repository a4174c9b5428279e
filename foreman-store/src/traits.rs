//! Store trait and compare-and-set outcome.

use crate::plan::ProjectPlan;
use async_trait::async_trait;
use foreman_core::{
    Phase, Project, ProjectId, ProjectStatus, RegistrationToken, StoreError, Task, TaskId,
    TaskStatus, TokenId, TransitionRecord, Worker, WorkerId,
};
use std::collections::HashMap;

/// Outcome of a compare-and-set task mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The mutation was applied; the stored version now equals the staged one.
    Applied,
    /// The expected version did not match; nothing was written.
    VersionMismatch { actual: i64 },
    /// No task with that id exists.
    NotFound,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied)
    }
}

/// Typed persistence operations used by the orchestration core.
///
/// Connection and serialization failures surface as
/// `StoreError::Unavailable` and are retriable; everything else is
/// deterministic.
#[async_trait]
pub trait Store: Send + Sync {
    // ========================================================================
    // PROJECTS
    // ========================================================================

    async fn create_project(
        &self,
        name: &str,
        description: &str,
        repo_path: &str,
    ) -> Result<Project, StoreError>;

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StoreError>;

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError>;

    async fn set_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> Result<Project, StoreError>;

    /// Persist a decomposition plan (phases + tasks + dependency edges) as a
    /// single unit. Validation failures (cycle, dangling reference, duplicate
    /// ordinal or branch) reject the whole batch with
    /// `StoreError::Constraint` and persist nothing.
    async fn apply_plan(
        &self,
        project_id: ProjectId,
        plan: &ProjectPlan,
    ) -> Result<(Vec<Phase>, Vec<Task>), StoreError>;

    // ========================================================================
    // PHASES
    // ========================================================================

    async fn list_phases(&self, project_id: ProjectId) -> Result<Vec<Phase>, StoreError>;

    // ========================================================================
    // TASKS
    // ========================================================================

    /// Fetch a task with its dependency ids populated.
    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// All tasks of a project, optionally filtered to a status set.
    async fn list_tasks(
        &self,
        project_id: ProjectId,
        statuses: Option<&[TaskStatus]>,
    ) -> Result<Vec<Task>, StoreError>;

    /// Group-count of a project's tasks by status, for board stats.
    async fn count_tasks_by_status(
        &self,
        project_id: ProjectId,
    ) -> Result<HashMap<TaskStatus, i64>, StoreError>;

    /// Current statuses of a task's dependencies.
    async fn dependency_statuses(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<(TaskId, TaskStatus)>, StoreError>;

    /// `waiting` tasks that list `task_id` in their dependency set. Backed by
    /// the reverse index over the join table.
    async fn waiting_dependents(&self, task_id: TaskId) -> Result<Vec<Task>, StoreError>;

    /// Tasks currently attributed to a worker, filtered to a status set.
    async fn tasks_for_worker(
        &self,
        worker_id: WorkerId,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError>;

    /// Apply a staged task state and its transition record atomically, keyed
    /// on `new_task.version - 1`. The record is only written when the task
    /// write applies.
    async fn apply_transition(
        &self,
        new_task: &Task,
        record: &TransitionRecord,
    ) -> Result<CasOutcome, StoreError>;

    /// Field-only compare-and-set update (no status change, no audit record).
    /// `new_task.version` must be exactly one above the version being
    /// replaced.
    async fn update_task_fields(&self, new_task: &Task) -> Result<CasOutcome, StoreError>;

    /// Transition history of a task, oldest first.
    async fn list_transitions(&self, task_id: TaskId)
        -> Result<Vec<TransitionRecord>, StoreError>;

    // ========================================================================
    // WORKERS
    // ========================================================================

    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError>;

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError>;

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError>;

    /// Record a heartbeat timestamp.
    async fn touch_worker(
        &self,
        id: WorkerId,
        at: foreman_core::Timestamp,
    ) -> Result<bool, StoreError>;

    /// Set or clear the worker's current task.
    async fn set_worker_task(
        &self,
        id: WorkerId,
        task_id: Option<TaskId>,
    ) -> Result<bool, StoreError>;

    async fn delete_worker(&self, id: WorkerId) -> Result<bool, StoreError>;

    // ========================================================================
    // REGISTRATION TOKENS
    // ========================================================================

    async fn insert_token(&self, token: &RegistrationToken) -> Result<(), StoreError>;

    async fn get_token_by_digest(
        &self,
        digest: &str,
    ) -> Result<Option<RegistrationToken>, StoreError>;

    async fn list_tokens(&self) -> Result<Vec<RegistrationToken>, StoreError>;

    async fn revoke_token(&self, id: TokenId) -> Result<bool, StoreError>;

    /// Mark a token consumed iff it is not already consumed. Returns `false`
    /// when another registration won the race.
    async fn consume_token(
        &self,
        id: TokenId,
        at: foreman_core::Timestamp,
    ) -> Result<bool, StoreError>;
}
