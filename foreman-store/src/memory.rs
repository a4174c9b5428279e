//! In-memory store.
//!
//! Backs the test suites and single-node demos. Same contract as `PgStore`,
//! including CAS semantics and all-or-nothing plan application. The
//! `set_unavailable` toggle lets tests exercise the retriable-failure paths.

use crate::plan::{validate_plan, ProjectPlan};
use crate::traits::{CasOutcome, Store};
use async_trait::async_trait;
use chrono::Utc;
use foreman_core::{
    EntityIdType, Phase, PhaseId, PhaseStatus, Project, ProjectId, ProjectStatus,
    RegistrationToken, StoreError, Task, TaskId, TaskStatus, Timestamp, TokenId,
    TransitionRecord, Worker, WorkerId,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct Inner {
    projects: HashMap<ProjectId, Project>,
    phases: HashMap<PhaseId, Phase>,
    tasks: HashMap<TaskId, Task>,
    transitions: Vec<TransitionRecord>,
    workers: HashMap<WorkerId, Worker>,
    tokens: HashMap<TokenId, RegistrationToken>,
}

/// Process-local `Store`. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent operation fail with `StoreError::Unavailable`
    /// until switched back. Used to test retry/backoff paths.
    pub fn set_unavailable(&self, value: bool) {
        self.unavailable.store(value, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable {
                reason: "store marked unavailable".to_string(),
            })
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    // ========================================================================
    // PROJECTS
    // ========================================================================

    async fn create_project(
        &self,
        name: &str,
        description: &str,
        repo_path: &str,
    ) -> Result<Project, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let project = Project {
            id: ProjectId::now_v7(),
            name: name.to_string(),
            description: description.to_string(),
            repo_path: repo_path.to_string(),
            status: ProjectStatus::Design,
            created_at: now,
            updated_at: now,
        };
        let mut inner = self.inner.lock().await;
        inner.projects.insert(project.id, project.clone());
        Ok(project)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.projects.get(&id).cloned())
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut projects: Vec<Project> = inner.projects.values().cloned().collect();
        projects.sort_by_key(|p| p.id);
        Ok(projects)
    }

    async fn set_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> Result<Project, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let project = inner
            .projects
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            })?;
        project.status = status;
        project.updated_at = Utc::now();
        Ok(project.clone())
    }

    async fn apply_plan(
        &self,
        project_id: ProjectId,
        plan: &ProjectPlan,
    ) -> Result<(Vec<Phase>, Vec<Task>), StoreError> {
        self.check_available()?;
        validate_plan(plan)?;

        let mut inner = self.inner.lock().await;
        if !inner.projects.contains_key(&project_id) {
            return Err(StoreError::NotFound {
                entity: "project",
                id: project_id.to_string(),
            });
        }

        let now = Utc::now();
        let mut key_to_id: HashMap<&str, TaskId> = HashMap::new();
        for task in plan.phases.iter().flat_map(|p| p.tasks.iter()) {
            key_to_id.insert(task.key.as_str(), TaskId::now_v7());
        }

        let mut phases = Vec::new();
        let mut tasks = Vec::new();
        for (index, plan_phase) in plan.phases.iter().enumerate() {
            let phase = Phase {
                id: PhaseId::now_v7(),
                project_id,
                ordinal: index as i32 + 1,
                name: plan_phase.name.clone(),
                description: plan_phase.description.clone(),
                branch_name: plan_phase.branch_name.clone(),
                status: PhaseStatus::Pending,
                created_at: now,
                updated_at: now,
            };
            for plan_task in &plan_phase.tasks {
                let depends_on: Vec<TaskId> = plan_task
                    .depends_on
                    .iter()
                    .map(|key| key_to_id[key.as_str()])
                    .collect();
                let mut task = Task::new_planned(
                    project_id,
                    phase.id,
                    plan_task.title.clone(),
                    plan_task.priority,
                    depends_on,
                    now,
                );
                task.id = key_to_id[plan_task.key.as_str()];
                task.description = plan_task.description.clone();
                task.worker_prompt = plan_task.worker_prompt.clone();
                task.qa_prompt = plan_task.qa_prompt.clone();
                task.branch_name = plan_task.branch_name.clone();
                tasks.push(task);
            }
            phases.push(phase);
        }

        for phase in &phases {
            inner.phases.insert(phase.id, phase.clone());
        }
        for task in &tasks {
            inner.tasks.insert(task.id, task.clone());
        }
        Ok((phases, tasks))
    }

    // ========================================================================
    // PHASES
    // ========================================================================

    async fn list_phases(&self, project_id: ProjectId) -> Result<Vec<Phase>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut phases: Vec<Phase> = inner
            .phases
            .values()
            .filter(|p| p.project_id == project_id)
            .cloned()
            .collect();
        phases.sort_by_key(|p| p.ordinal);
        Ok(phases)
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.tasks.get(&id).cloned())
    }

    async fn list_tasks(
        &self,
        project_id: ProjectId,
        statuses: Option<&[TaskStatus]>,
    ) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id)
            .filter(|t| statuses.map_or(true, |set| set.contains(&t.status)))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn count_tasks_by_status(
        &self,
        project_id: ProjectId,
    ) -> Result<HashMap<TaskStatus, i64>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for task in inner.tasks.values() {
            if task.project_id == project_id {
                *counts.entry(task.status).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn dependency_statuses(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<(TaskId, TaskStatus)>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let task = inner.tasks.get(&task_id).ok_or_else(|| StoreError::NotFound {
            entity: "task",
            id: task_id.to_string(),
        })?;
        Ok(task
            .depends_on
            .iter()
            .filter_map(|dep_id| inner.tasks.get(dep_id).map(|dep| (*dep_id, dep.status)))
            .collect())
    }

    async fn waiting_dependents(&self, task_id: TaskId) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut dependents: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Waiting && t.depends_on.contains(&task_id))
            .cloned()
            .collect();
        dependents.sort_by_key(|t| t.id);
        Ok(dependents)
    }

    async fn tasks_for_worker(
        &self,
        worker_id: WorkerId,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.worker_id == Some(worker_id) && statuses.contains(&t.status))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id);
        Ok(tasks)
    }

    async fn apply_transition(
        &self,
        new_task: &Task,
        record: &TransitionRecord,
    ) -> Result<CasOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.tasks.get(&new_task.id) else {
            return Ok(CasOutcome::NotFound);
        };
        if current.version != new_task.version - 1 {
            return Ok(CasOutcome::VersionMismatch {
                actual: current.version,
            });
        }
        inner.tasks.insert(new_task.id, new_task.clone());
        inner.transitions.push(record.clone());
        Ok(CasOutcome::Applied)
    }

    async fn update_task_fields(&self, new_task: &Task) -> Result<CasOutcome, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.tasks.get(&new_task.id) else {
            return Ok(CasOutcome::NotFound);
        };
        if current.version != new_task.version - 1 {
            return Ok(CasOutcome::VersionMismatch {
                actual: current.version,
            });
        }
        inner.tasks.insert(new_task.id, new_task.clone());
        Ok(CasOutcome::Applied)
    }

    async fn list_transitions(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .transitions
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect())
    }

    // ========================================================================
    // WORKERS
    // ========================================================================

    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.workers.get(&id).cloned())
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut workers: Vec<Worker> = inner.workers.values().cloned().collect();
        workers.sort_by_key(|w| w.id);
        Ok(workers)
    }

    async fn touch_worker(&self, id: WorkerId, at: Timestamp) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.workers.get_mut(&id) {
            Some(worker) => {
                worker.last_heartbeat = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_worker_task(
        &self,
        id: WorkerId,
        task_id: Option<TaskId>,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.workers.get_mut(&id) {
            Some(worker) => {
                worker.current_task_id = task_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_worker(&self, id: WorkerId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        Ok(inner.workers.remove(&id).is_some())
    }

    // ========================================================================
    // REGISTRATION TOKENS
    // ========================================================================

    async fn insert_token(&self, token: &RegistrationToken) -> Result<(), StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner.tokens.insert(token.id, token.clone());
        Ok(())
    }

    async fn get_token_by_digest(
        &self,
        digest: &str,
    ) -> Result<Option<RegistrationToken>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner
            .tokens
            .values()
            .find(|t| t.token_digest == digest)
            .cloned())
    }

    async fn list_tokens(&self) -> Result<Vec<RegistrationToken>, StoreError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut tokens: Vec<RegistrationToken> = inner.tokens.values().cloned().collect();
        tokens.sort_by_key(|t| t.id);
        Ok(tokens)
    }

    async fn revoke_token(&self, id: TokenId) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.tokens.get_mut(&id) {
            Some(token) => {
                token.revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn consume_token(&self, id: TokenId, at: Timestamp) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.tokens.get_mut(&id) {
            Some(token) if token.consumed_at.is_none() => {
                token.consumed_at = Some(at);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }
}
