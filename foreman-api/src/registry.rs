//! Worker Registry
//!
//! Registration consumes a single-use token and mints a worker secret; every
//! subsequent call must present that secret. Liveness is derived on read:
//! `busy` while a task is attributed, `offline` after two missed heartbeat
//! intervals, `idle` otherwise. Nothing here is destructive on staleness.

use crate::types::{HeartbeatDirective, HeartbeatResponse};
use chrono::Utc;
use foreman_core::{
    generate_secret, secret_digest, EntityIdType, ForemanError, RegistryError, TaskId,
    TaskStatus, Timestamp, Worker, WorkerId, WorkerStatus,
};
use foreman_store::Store;
use std::sync::Arc;
use std::time::Duration;

/// Registry over the durable worker table. Worker rows are canonical in the
/// store; this layer adds token consumption, secret checks and the derived
/// status classification.
pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    heartbeat_interval: Duration,
}

/// Outcome of a successful registration. The plaintext secret exists only in
/// this value; the store keeps its digest.
pub struct Registered {
    pub worker: Worker,
    pub worker_secret: String,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, heartbeat_interval: Duration) -> Self {
        Self {
            store,
            heartbeat_interval,
        }
    }

    /// Task statuses that keep a task attributed to its worker.
    const IN_FLIGHT: [TaskStatus; 3] = [
        TaskStatus::Queued,
        TaskStatus::InProgress,
        TaskStatus::Review,
    ];

    // ========================================================================
    // REGISTRATION
    // ========================================================================

    /// Validate and consume a registration token, create the worker, and
    /// return `(worker, worker_secret)`.
    pub async fn register(
        &self,
        token_plain: &str,
        name: Option<String>,
        platform: String,
        capabilities: Vec<String>,
        executor_type: String,
    ) -> Result<Registered, ForemanError> {
        let now = Utc::now();
        let digest = secret_digest(token_plain);
        let token = self
            .store
            .get_token_by_digest(&digest)
            .await?
            .ok_or(RegistryError::UnknownToken)?;

        if token.revoked {
            return Err(RegistryError::TokenRevoked.into());
        }
        if token.consumed_at.is_some() {
            return Err(RegistryError::TokenAlreadyUsed.into());
        }
        if token.expires_at.is_some_and(|exp| now >= exp) {
            return Err(RegistryError::TokenExpired.into());
        }

        // Atomic consumption; a concurrent registration with the same token
        // loses here.
        if !self.store.consume_token(token.id, now).await? {
            return Err(RegistryError::TokenAlreadyUsed.into());
        }

        let worker_id = WorkerId::now_v7();
        let worker_secret = generate_secret();
        let worker = Worker {
            id: worker_id,
            name: name.unwrap_or_else(|| format!("worker-{:.8}", worker_id.to_string())),
            platform,
            executor_type,
            capabilities,
            secret_digest: secret_digest(&worker_secret),
            current_task_id: None,
            registered_at: now,
            last_heartbeat: Some(now),
        };
        self.store.insert_worker(&worker).await?;

        tracing::info!(worker_id = %worker.id, name = %worker.name, "Worker registered");
        Ok(Registered {
            worker,
            worker_secret,
        })
    }

    // ========================================================================
    // AUTHENTICATION
    // ========================================================================

    /// Verify `(worker_id, secret)`; returns the worker on success.
    pub async fn verify(
        &self,
        worker_id: WorkerId,
        secret: &str,
    ) -> Result<Worker, ForemanError> {
        let worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(RegistryError::WorkerNotFound(worker_id))?;
        if worker.secret_digest != secret_digest(secret) {
            return Err(RegistryError::InvalidSecret.into());
        }
        Ok(worker)
    }

    // ========================================================================
    // HEARTBEAT
    // ========================================================================

    /// Record a heartbeat and report the worker's pending assignments. A
    /// heartbeat is the only way an `offline` worker returns to `idle`.
    pub async fn heartbeat(
        &self,
        worker_id: WorkerId,
        secret: &str,
    ) -> Result<HeartbeatResponse, ForemanError> {
        let worker = self.verify(worker_id, secret).await?;
        let now = Utc::now();
        self.store.touch_worker(worker_id, now).await?;

        let pending = self
            .store
            .tasks_for_worker(worker_id, &[TaskStatus::Queued])
            .await?;

        // If the attributed task is no longer in flight (cancelled or
        // reconciled elsewhere), tell the worker to drain and clear the
        // attribution.
        let mut directive = None;
        let mut current_task_id = worker.current_task_id;
        if let Some(task_id) = worker.current_task_id {
            let still_active = self
                .store
                .get_task(task_id)
                .await?
                .map(|t| Self::IN_FLIGHT.contains(&t.status))
                .unwrap_or(false);
            if !still_active {
                directive = Some(HeartbeatDirective::Drain);
                current_task_id = None;
                self.store.set_worker_task(worker_id, None).await?;
            }
        }

        let status = if current_task_id.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        };

        Ok(HeartbeatResponse {
            status,
            pending_tasks: pending.len(),
            current_task_id,
            directive,
        })
    }

    // ========================================================================
    // LIVENESS & SELECTION
    // ========================================================================

    /// Derived liveness, never persisted. Staleness wins over busyness: a
    /// silent worker is `offline` even mid-task (its task stays untouched
    /// regardless).
    pub fn classify(&self, worker: &Worker, now: Timestamp) -> WorkerStatus {
        let cutoff = chrono::Duration::from_std(self.heartbeat_interval * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let alive = matches!(worker.last_heartbeat, Some(seen) if now - seen <= cutoff);
        if !alive {
            WorkerStatus::Offline
        } else if worker.current_task_id.is_some() {
            WorkerStatus::Busy
        } else {
            WorkerStatus::Idle
        }
    }

    /// All workers with their derived status.
    pub async fn list_classified(&self) -> Result<Vec<(Worker, WorkerStatus)>, ForemanError> {
        let now = Utc::now();
        let workers = self.store.list_workers().await?;
        Ok(workers
            .into_iter()
            .map(|w| {
                let status = self.classify(&w, now);
                (w, status)
            })
            .collect())
    }

    /// Pick an idle worker whose capability set covers `required`. An empty
    /// required set matches any idle worker.
    pub async fn select_idle(&self, required: &[String]) -> Result<Worker, ForemanError> {
        let classified = self.list_classified().await?;
        classified
            .into_iter()
            .filter(|(_, status)| *status == WorkerStatus::Idle)
            .map(|(w, _)| w)
            .find(|w| required.iter().all(|cap| w.capabilities.contains(cap)))
            .ok_or_else(|| RegistryError::NoEligibleWorker.into())
    }

    /// Attribute (or clear) a task on the worker row.
    pub async fn set_current_task(
        &self,
        worker_id: WorkerId,
        task_id: Option<TaskId>,
    ) -> Result<(), ForemanError> {
        self.store.set_worker_task(worker_id, task_id).await?;
        Ok(())
    }

    /// Administrative removal. Refused while the worker's current task is
    /// `in_progress`, unless forced.
    pub async fn remove(&self, worker_id: WorkerId, force: bool) -> Result<bool, ForemanError> {
        if !force {
            if let Some(worker) = self.store.get_worker(worker_id).await? {
                if let Some(task_id) = worker.current_task_id {
                    let in_progress = self
                        .store
                        .get_task(task_id)
                        .await?
                        .map(|t| t.status == TaskStatus::InProgress)
                        .unwrap_or(false);
                    if in_progress {
                        return Err(RegistryError::WorkerBusy(worker_id).into());
                    }
                }
            }
        }
        Ok(self.store.delete_worker(worker_id).await?)
    }
}
