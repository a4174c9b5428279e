//! Postgres store.
//!
//! Production implementation of `Store` over a deadpool-postgres pool. All
//! SQL is parameterized; rows are decoded through the helpers at the bottom.
//! The CAS discipline is expressed directly in the UPDATE predicates:
//! `WHERE id = $1 AND version = $2`.

use crate::plan::{validate_plan, ProjectPlan};
use crate::traits::{CasOutcome, Store};
use async_trait::async_trait;
use chrono::Utc;
use deadpool_postgres::{Config, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime, Timeouts};
use foreman_core::{
    Actor, EntityIdType, Phase, PhaseId, PhaseStatus, Project, ProjectId, ProjectStatus,
    RegistrationToken, StoreError, Task, TaskId, TaskPriority, TaskStatus, Timestamp, TokenId,
    TransitionId, TransitionRecord, Worker, WorkerId,
};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::time::Duration;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

// ============================================================================
// CONNECTION POOL CONFIGURATION
// ============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub user: String,
    pub password: String,
    pub max_size: usize,
    pub timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            dbname: "foreman".to_string(),
            user: "postgres".to_string(),
            password: String::new(),
            max_size: 16,
            timeout: Duration::from_secs(5),
        }
    }
}

impl DbConfig {
    /// Read configuration from `FOREMAN_DB_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("FOREMAN_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("FOREMAN_DB_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5432),
            dbname: std::env::var("FOREMAN_DB_NAME").unwrap_or_else(|_| "foreman".to_string()),
            user: std::env::var("FOREMAN_DB_USER").unwrap_or_else(|_| "postgres".to_string()),
            password: std::env::var("FOREMAN_DB_PASSWORD").unwrap_or_default(),
            max_size: std::env::var("FOREMAN_DB_POOL_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(16),
            timeout: Duration::from_secs(
                std::env::var("FOREMAN_DB_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),
        }
    }

    pub fn create_pool(&self) -> Result<Pool, StoreError> {
        let mut cfg = Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.dbname.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        let mut pool_config = PoolConfig::new(self.max_size);
        pool_config.timeouts = Timeouts {
            wait: Some(self.timeout),
            create: Some(self.timeout),
            recycle: Some(self.timeout),
        };
        cfg.pool = Some(pool_config);
        cfg.create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| StoreError::Unavailable {
                reason: format!("failed to create pool: {}", e),
            })
    }
}

// ============================================================================
// STORE
// ============================================================================

const TASK_COLUMNS: &str = "id, project_id, phase_id, title, description, status, priority, \
     version, worker_prompt, qa_prompt, worker_id, reviewer_id, branch_name, commit_hash, \
     qa_result, output_path, error_message, assignment_message_id, created_at, updated_at, \
     started_at, completed_at";

/// Postgres-backed `Store`.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn from_config(config: &DbConfig) -> Result<Self, StoreError> {
        Ok(Self::new(config.create_pool()?))
    }

    /// Current pool size, for observability.
    pub fn pool_size(&self) -> usize {
        self.pool.status().size
    }

    async fn conn(&self) -> Result<deadpool_postgres::Object, StoreError> {
        self.pool.get().await.map_err(|e| StoreError::Unavailable {
            reason: format!("pool: {}", e),
        })
    }

    async fn load_deps(
        conn: &deadpool_postgres::Object,
        task_id: Uuid,
    ) -> Result<Vec<TaskId>, StoreError> {
        let rows = conn
            .query(
                "SELECT depends_on_id FROM task_deps WHERE task_id = $1 ORDER BY depends_on_id",
                &[&task_id],
            )
            .await
            .map_err(unavailable)?;
        Ok(rows.iter().map(|r| TaskId::new(r.get(0))).collect())
    }

    async fn task_with_deps(
        conn: &deadpool_postgres::Object,
        row: &Row,
    ) -> Result<Task, StoreError> {
        let mut task = task_from_row(row)?;
        task.depends_on = Self::load_deps(conn, task.id.as_uuid()).await?;
        Ok(task)
    }
}

fn unavailable(e: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable {
        reason: e.to_string(),
    }
}

#[async_trait]
impl Store for PgStore {
    // ========================================================================
    // PROJECTS
    // ========================================================================

    async fn create_project(
        &self,
        name: &str,
        description: &str,
        repo_path: &str,
    ) -> Result<Project, StoreError> {
        let conn = self.conn().await?;
        let id = ProjectId::now_v7();
        let row = conn
            .query_one(
                "INSERT INTO projects (id, name, description, repo_path, status) \
                 VALUES ($1, $2, $3, $4, 'design') \
                 RETURNING id, name, description, repo_path, status, created_at, updated_at",
                &[&id.as_uuid(), &name, &description, &repo_path],
            )
            .await
            .map_err(unavailable)?;
        project_from_row(&row)
    }

    async fn get_project(&self, id: ProjectId) -> Result<Option<Project>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, name, description, repo_path, status, created_at, updated_at \
                 FROM projects WHERE id = $1",
                &[&id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        row.map(|r| project_from_row(&r)).transpose()
    }

    async fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, name, description, repo_path, status, created_at, updated_at \
                 FROM projects ORDER BY id",
                &[],
            )
            .await
            .map_err(unavailable)?;
        rows.iter().map(project_from_row).collect()
    }

    async fn set_project_status(
        &self,
        id: ProjectId,
        status: ProjectStatus,
    ) -> Result<Project, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "UPDATE projects SET status = $2, updated_at = now() WHERE id = $1 \
                 RETURNING id, name, description, repo_path, status, created_at, updated_at",
                &[&id.as_uuid(), &status.as_db_str()],
            )
            .await
            .map_err(unavailable)?;
        match row {
            Some(r) => project_from_row(&r),
            None => Err(StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            }),
        }
    }

    async fn apply_plan(
        &self,
        project_id: ProjectId,
        plan: &ProjectPlan,
    ) -> Result<(Vec<Phase>, Vec<Task>), StoreError> {
        validate_plan(plan)?;

        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(unavailable)?;

        let exists = tx
            .query_opt("SELECT 1 FROM projects WHERE id = $1", &[&project_id.as_uuid()])
            .await
            .map_err(unavailable)?;
        if exists.is_none() {
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
            tx.execute(
                "INSERT INTO phases \
                 (id, project_id, ordinal, name, description, branch_name, status, \
                  created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8)",
                &[
                    &phase.id.as_uuid(),
                    &project_id.as_uuid(),
                    &phase.ordinal,
                    &phase.name,
                    &phase.description,
                    &phase.branch_name,
                    &phase.status.as_db_str(),
                    &now,
                ],
            )
            .await
            .map_err(constraint_or_unavailable)?;

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

                tx.execute(
                    "INSERT INTO tasks \
                     (id, project_id, phase_id, title, description, status, priority, \
                      version, worker_prompt, qa_prompt, branch_name, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)",
                    &[
                        &task.id.as_uuid(),
                        &project_id.as_uuid(),
                        &phase.id.as_uuid(),
                        &task.title,
                        &task.description,
                        &task.status.as_db_str(),
                        &task.priority.as_db_str(),
                        &task.version,
                        &task.worker_prompt,
                        &task.qa_prompt,
                        &task.branch_name,
                        &now,
                    ],
                )
                .await
                .map_err(constraint_or_unavailable)?;
                tasks.push(task);
            }
            phases.push(phase);
        }

        // Edges go in after every task row exists.
        for task in &tasks {
            for dep in &task.depends_on {
                tx.execute(
                    "INSERT INTO task_deps (task_id, depends_on_id) VALUES ($1, $2)",
                    &[&task.id.as_uuid(), &dep.as_uuid()],
                )
                .await
                .map_err(constraint_or_unavailable)?;
            }
        }

        tx.commit().await.map_err(unavailable)?;
        Ok((phases, tasks))
    }

    // ========================================================================
    // PHASES
    // ========================================================================

    async fn list_phases(&self, project_id: ProjectId) -> Result<Vec<Phase>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, project_id, ordinal, name, description, branch_name, status, \
                        created_at, updated_at \
                 FROM phases WHERE project_id = $1 ORDER BY ordinal",
                &[&project_id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        rows.iter().map(phase_from_row).collect()
    }

    // ========================================================================
    // TASKS
    // ========================================================================

    async fn get_task(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                &format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS),
                &[&id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        match row {
            Some(row) => Ok(Some(Self::task_with_deps(&conn, &row).await?)),
            None => Ok(None),
        }
    }

    async fn list_tasks(
        &self,
        project_id: ProjectId,
        statuses: Option<&[TaskStatus]>,
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn().await?;
        let rows = match statuses {
            Some(set) => {
                let set: Vec<&str> = set.iter().map(|s| s.as_db_str()).collect();
                conn.query(
                    &format!(
                        "SELECT {} FROM tasks \
                         WHERE project_id = $1 AND status = ANY($2) ORDER BY id",
                        TASK_COLUMNS
                    ),
                    &[&project_id.as_uuid(), &set],
                )
                .await
                .map_err(unavailable)?
            }
            None => conn
                .query(
                    &format!(
                        "SELECT {} FROM tasks WHERE project_id = $1 ORDER BY id",
                        TASK_COLUMNS
                    ),
                    &[&project_id.as_uuid()],
                )
                .await
                .map_err(unavailable)?,
        };

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(Self::task_with_deps(&conn, row).await?);
        }
        Ok(tasks)
    }

    async fn count_tasks_by_status(
        &self,
        project_id: ProjectId,
    ) -> Result<HashMap<TaskStatus, i64>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT status, count(*) FROM tasks WHERE project_id = $1 GROUP BY status",
                &[&project_id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        let mut counts = HashMap::new();
        for row in rows {
            let status: String = row.get(0);
            let count: i64 = row.get(1);
            counts.insert(parse_task_status(&status)?, count);
        }
        Ok(counts)
    }

    async fn dependency_statuses(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<(TaskId, TaskStatus)>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT t.id, t.status FROM task_deps d \
                 JOIN tasks t ON t.id = d.depends_on_id \
                 WHERE d.task_id = $1 ORDER BY t.id",
                &[&task_id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        rows.iter()
            .map(|row| {
                let status: String = row.get(1);
                Ok((TaskId::new(row.get(0)), parse_task_status(&status)?))
            })
            .collect()
    }

    async fn waiting_dependents(&self, task_id: TaskId) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM tasks t \
                     WHERE t.status = 'waiting' AND t.id IN \
                       (SELECT task_id FROM task_deps WHERE depends_on_id = $1) \
                     ORDER BY t.id",
                    task_columns_qualified()
                ),
                &[&task_id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(Self::task_with_deps(&conn, row).await?);
        }
        Ok(tasks)
    }

    async fn tasks_for_worker(
        &self,
        worker_id: WorkerId,
        statuses: &[TaskStatus],
    ) -> Result<Vec<Task>, StoreError> {
        let conn = self.conn().await?;
        let set: Vec<&str> = statuses.iter().map(|s| s.as_db_str()).collect();
        let rows = conn
            .query(
                &format!(
                    "SELECT {} FROM tasks \
                     WHERE worker_id = $1 AND status = ANY($2) ORDER BY id",
                    TASK_COLUMNS
                ),
                &[&worker_id.as_uuid(), &set],
            )
            .await
            .map_err(unavailable)?;
        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(Self::task_with_deps(&conn, row).await?);
        }
        Ok(tasks)
    }

    async fn apply_transition(
        &self,
        new_task: &Task,
        record: &TransitionRecord,
    ) -> Result<CasOutcome, StoreError> {
        let mut conn = self.conn().await?;
        let tx = conn.transaction().await.map_err(unavailable)?;

        let updated = tx
            .execute(
                "UPDATE tasks SET \
                     status = $3, priority = $4, version = $2, worker_id = $5, \
                     reviewer_id = $6, branch_name = $7, commit_hash = $8, qa_result = $9, \
                     output_path = $10, error_message = $11, assignment_message_id = $12, \
                     updated_at = $13, started_at = $14, completed_at = $15 \
                 WHERE id = $1 AND version = $2 - 1",
                &[
                    &new_task.id.as_uuid(),
                    &new_task.version,
                    &new_task.status.as_db_str(),
                    &new_task.priority.as_db_str(),
                    &new_task.worker_id.map(|w| w.as_uuid()),
                    &new_task.reviewer_id.map(|w| w.as_uuid()),
                    &new_task.branch_name,
                    &new_task.commit_hash,
                    &new_task.qa_result,
                    &new_task.output_path,
                    &new_task.error_message,
                    &new_task.assignment_message_id,
                    &new_task.updated_at,
                    &new_task.started_at,
                    &new_task.completed_at,
                ],
            )
            .await
            .map_err(unavailable)?;

        if updated == 0 {
            let actual = tx
                .query_opt(
                    "SELECT version FROM tasks WHERE id = $1",
                    &[&new_task.id.as_uuid()],
                )
                .await
                .map_err(unavailable)?;
            tx.rollback().await.map_err(unavailable)?;
            return Ok(match actual {
                Some(row) => CasOutcome::VersionMismatch { actual: row.get(0) },
                None => CasOutcome::NotFound,
            });
        }

        tx.execute(
            "INSERT INTO task_transitions \
             (id, task_id, from_status, to_status, actor, reason, stream_message_id, \
              recorded_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            &[
                &record.id.as_uuid(),
                &record.task_id.as_uuid(),
                &record.from_status.as_db_str(),
                &record.to_status.as_db_str(),
                &record.actor.to_string(),
                &record.reason,
                &record.stream_message_id,
                &record.recorded_at,
            ],
        )
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(CasOutcome::Applied)
    }

    async fn update_task_fields(&self, new_task: &Task) -> Result<CasOutcome, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE tasks SET \
                     version = $2, worker_id = $3, reviewer_id = $4, branch_name = $5, \
                     commit_hash = $6, qa_result = $7, output_path = $8, error_message = $9, \
                     assignment_message_id = $10, updated_at = $11 \
                 WHERE id = $1 AND version = $2 - 1",
                &[
                    &new_task.id.as_uuid(),
                    &new_task.version,
                    &new_task.worker_id.map(|w| w.as_uuid()),
                    &new_task.reviewer_id.map(|w| w.as_uuid()),
                    &new_task.branch_name,
                    &new_task.commit_hash,
                    &new_task.qa_result,
                    &new_task.output_path,
                    &new_task.error_message,
                    &new_task.assignment_message_id,
                    &new_task.updated_at,
                ],
            )
            .await
            .map_err(unavailable)?;
        if updated > 0 {
            return Ok(CasOutcome::Applied);
        }
        let actual = conn
            .query_opt(
                "SELECT version FROM tasks WHERE id = $1",
                &[&new_task.id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        Ok(match actual {
            Some(row) => CasOutcome::VersionMismatch { actual: row.get(0) },
            None => CasOutcome::NotFound,
        })
    }

    async fn list_transitions(
        &self,
        task_id: TaskId,
    ) -> Result<Vec<TransitionRecord>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, task_id, from_status, to_status, actor, reason, \
                        stream_message_id, recorded_at \
                 FROM task_transitions WHERE task_id = $1 ORDER BY recorded_at, id",
                &[&task_id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        rows.iter().map(transition_from_row).collect()
    }

    // ========================================================================
    // WORKERS
    // ========================================================================

    async fn insert_worker(&self, worker: &Worker) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        let capabilities = serde_json::to_value(&worker.capabilities).map_err(|e| {
            StoreError::Unavailable {
                reason: format!("serialize capabilities: {}", e),
            }
        })?;
        conn.execute(
            "INSERT INTO workers \
             (id, name, platform, executor_type, capabilities, secret_digest, \
              current_task_id, registered_at, last_heartbeat) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &worker.id.as_uuid(),
                &worker.name,
                &worker.platform,
                &worker.executor_type,
                &capabilities,
                &worker.secret_digest,
                &worker.current_task_id.map(|t| t.as_uuid()),
                &worker.registered_at,
                &worker.last_heartbeat,
            ],
        )
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn get_worker(&self, id: WorkerId) -> Result<Option<Worker>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, name, platform, executor_type, capabilities, secret_digest, \
                        current_task_id, registered_at, last_heartbeat \
                 FROM workers WHERE id = $1",
                &[&id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        row.map(|r| worker_from_row(&r)).transpose()
    }

    async fn list_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, name, platform, executor_type, capabilities, secret_digest, \
                        current_task_id, registered_at, last_heartbeat \
                 FROM workers ORDER BY id",
                &[],
            )
            .await
            .map_err(unavailable)?;
        rows.iter().map(worker_from_row).collect()
    }

    async fn touch_worker(&self, id: WorkerId, at: Timestamp) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE workers SET last_heartbeat = $2 WHERE id = $1",
                &[&id.as_uuid(), &at],
            )
            .await
            .map_err(unavailable)?;
        Ok(updated > 0)
    }

    async fn set_worker_task(
        &self,
        id: WorkerId,
        task_id: Option<TaskId>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE workers SET current_task_id = $2 WHERE id = $1",
                &[&id.as_uuid(), &task_id.map(|t| t.as_uuid())],
            )
            .await
            .map_err(unavailable)?;
        Ok(updated > 0)
    }

    async fn delete_worker(&self, id: WorkerId) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let deleted = conn
            .execute("DELETE FROM workers WHERE id = $1", &[&id.as_uuid()])
            .await
            .map_err(unavailable)?;
        Ok(deleted > 0)
    }

    // ========================================================================
    // REGISTRATION TOKENS
    // ========================================================================

    async fn insert_token(&self, token: &RegistrationToken) -> Result<(), StoreError> {
        let conn = self.conn().await?;
        conn.execute(
            "INSERT INTO registration_tokens \
             (id, token_digest, name, created_at, expires_at, revoked, consumed_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
            &[
                &token.id.as_uuid(),
                &token.token_digest,
                &token.name,
                &token.created_at,
                &token.expires_at,
                &token.revoked,
                &token.consumed_at,
            ],
        )
        .await
        .map_err(constraint_or_unavailable)?;
        Ok(())
    }

    async fn get_token_by_digest(
        &self,
        digest: &str,
    ) -> Result<Option<RegistrationToken>, StoreError> {
        let conn = self.conn().await?;
        let row = conn
            .query_opt(
                "SELECT id, token_digest, name, created_at, expires_at, revoked, consumed_at \
                 FROM registration_tokens WHERE token_digest = $1",
                &[&digest],
            )
            .await
            .map_err(unavailable)?;
        row.map(|r| token_from_row(&r)).transpose()
    }

    async fn list_tokens(&self) -> Result<Vec<RegistrationToken>, StoreError> {
        let conn = self.conn().await?;
        let rows = conn
            .query(
                "SELECT id, token_digest, name, created_at, expires_at, revoked, consumed_at \
                 FROM registration_tokens ORDER BY id",
                &[],
            )
            .await
            .map_err(unavailable)?;
        rows.iter().map(token_from_row).collect()
    }

    async fn revoke_token(&self, id: TokenId) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE registration_tokens SET revoked = true WHERE id = $1",
                &[&id.as_uuid()],
            )
            .await
            .map_err(unavailable)?;
        Ok(updated > 0)
    }

    async fn consume_token(&self, id: TokenId, at: Timestamp) -> Result<bool, StoreError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE registration_tokens SET consumed_at = $2 \
                 WHERE id = $1 AND consumed_at IS NULL",
                &[&id.as_uuid(), &at],
            )
            .await
            .map_err(unavailable)?;
        Ok(updated > 0)
    }
}

// ============================================================================
// ROW DECODING
// ============================================================================

fn task_columns_qualified() -> String {
    TASK_COLUMNS
        .split(", ")
        .map(|c| format!("t.{}", c))
        .collect::<Vec<_>>()
        .join(", ")
}

fn constraint_or_unavailable(e: tokio_postgres::Error) -> StoreError {
    if e.code().is_some() {
        StoreError::Constraint {
            reason: e.to_string(),
        }
    } else {
        unavailable(e)
    }
}

fn parse_task_status(s: &str) -> Result<TaskStatus, StoreError> {
    TaskStatus::from_db_str(s).map_err(|e| StoreError::Constraint {
        reason: e.to_string(),
    })
}

fn project_from_row(row: &Row) -> Result<Project, StoreError> {
    let status: String = row.get(4);
    Ok(Project {
        id: ProjectId::new(row.get(0)),
        name: row.get(1),
        description: row.get(2),
        repo_path: row.get(3),
        status: ProjectStatus::from_db_str(&status).map_err(|e| StoreError::Constraint {
            reason: e.to_string(),
        })?,
        created_at: row.get(5),
        updated_at: row.get(6),
    })
}

fn phase_from_row(row: &Row) -> Result<Phase, StoreError> {
    let status: String = row.get(6);
    Ok(Phase {
        id: PhaseId::new(row.get(0)),
        project_id: ProjectId::new(row.get(1)),
        ordinal: row.get(2),
        name: row.get(3),
        description: row.get(4),
        branch_name: row.get(5),
        status: PhaseStatus::from_db_str(&status).map_err(|e| StoreError::Constraint {
            reason: e.to_string(),
        })?,
        created_at: row.get(7),
        updated_at: row.get(8),
    })
}

fn task_from_row(row: &Row) -> Result<Task, StoreError> {
    let status: String = row.get(5);
    let priority: String = row.get(6);
    let worker_id: Option<Uuid> = row.get(10);
    let reviewer_id: Option<Uuid> = row.get(11);
    Ok(Task {
        id: TaskId::new(row.get(0)),
        project_id: ProjectId::new(row.get(1)),
        phase_id: PhaseId::new(row.get(2)),
        title: row.get(3),
        description: row.get(4),
        status: parse_task_status(&status)?,
        priority: TaskPriority::from_db_str(&priority).map_err(|e| StoreError::Constraint {
            reason: e.to_string(),
        })?,
        version: row.get(7),
        depends_on: Vec::new(),
        worker_prompt: row.get(8),
        qa_prompt: row.get(9),
        worker_id: worker_id.map(WorkerId::new),
        reviewer_id: reviewer_id.map(WorkerId::new),
        branch_name: row.get(12),
        commit_hash: row.get(13),
        qa_result: row.get(14),
        output_path: row.get(15),
        error_message: row.get(16),
        assignment_message_id: row.get(17),
        created_at: row.get(18),
        updated_at: row.get(19),
        started_at: row.get(20),
        completed_at: row.get(21),
    })
}

fn transition_from_row(row: &Row) -> Result<TransitionRecord, StoreError> {
    let from_status: String = row.get(2);
    let to_status: String = row.get(3);
    let actor: String = row.get(4);
    Ok(TransitionRecord {
        id: TransitionId::new(row.get(0)),
        task_id: TaskId::new(row.get(1)),
        from_status: parse_task_status(&from_status)?,
        to_status: parse_task_status(&to_status)?,
        actor: actor.parse::<Actor>().map_err(|e| StoreError::Constraint {
            reason: e.to_string(),
        })?,
        reason: row.get(5),
        stream_message_id: row.get(6),
        recorded_at: row.get(7),
    })
}

fn worker_from_row(row: &Row) -> Result<Worker, StoreError> {
    let capabilities: JsonValue = row.get(4);
    let capabilities: Vec<String> =
        serde_json::from_value(capabilities).map_err(|e| StoreError::Constraint {
            reason: format!("capabilities: {}", e),
        })?;
    let current_task_id: Option<Uuid> = row.get(6);
    Ok(Worker {
        id: WorkerId::new(row.get(0)),
        name: row.get(1),
        platform: row.get(2),
        executor_type: row.get(3),
        capabilities,
        secret_digest: row.get(5),
        current_task_id: current_task_id.map(TaskId::new),
        registered_at: row.get(7),
        last_heartbeat: row.get(8),
    })
}

fn token_from_row(row: &Row) -> Result<RegistrationToken, StoreError> {
    Ok(RegistrationToken {
        id: TokenId::new(row.get(0)),
        token_digest: row.get(1),
        name: row.get(2),
        created_at: row.get(3),
        expires_at: row.get(4),
        revoked: row.get(5),
        consumed_at: row.get(6),
    })
}
