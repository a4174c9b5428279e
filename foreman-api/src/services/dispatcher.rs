//! Dispatcher
//!
//! One operation: move a `ready` task to `queued` and hand it to a worker.
//! The reservation is an optimistic CAS; the assignment record is published
//! only after the reservation holds, and the stream message id is attached
//! with a follow-up CAS. Any failure after the reservation rolls the task
//! back to `ready` so the next tick can retry cleanly.

use crate::events::{BoardBus, BoardEvent};
use crate::registry::WorkerRegistry;
use crate::services::required_capabilities;
use crate::types::AssignmentMessage;
use chrono::Utc;
use foreman_core::{
    Actor, ForemanError, ProjectStatus, QueueError, RegistryError, Task, TaskStatus, Worker,
};
use foreman_queue::{assign_stream, StreamQueue};
use foreman_state::{plan_transition, TransitionEffects, TransitionInput};
use foreman_store::{CasOutcome, Store};
use std::sync::Arc;
use std::time::Duration;

/// Publish budget for one assignment record.
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// What became of a dispatch attempt. Only `Dispatched` changed anything
/// durable; the rest leave the task where it was.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Dispatched(Task),
    /// No idle worker covers the task's required capabilities; retry later.
    NoEligibleWorker,
    /// The project is not `active`; nothing is dispatched.
    ProjectInactive,
    /// The task was taken or moved by a concurrent actor; given up silently.
    Skipped,
}

pub struct Dispatcher {
    store: Arc<dyn Store>,
    queue: Arc<dyn StreamQueue>,
    registry: Arc<WorkerRegistry>,
    bus: Arc<BoardBus>,
    retries: u32,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn StreamQueue>,
        registry: Arc<WorkerRegistry>,
        bus: Arc<BoardBus>,
        retries: u32,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            bus,
            retries,
        }
    }

    /// Dispatch one task. See module docs for the reserve/publish/record
    /// protocol.
    pub async fn dispatch(&self, task: &Task) -> Result<DispatchOutcome, ForemanError> {
        let mut task = task.clone();

        for attempt in 0..self.retries {
            // Never dispatch into a non-active project.
            let project = self.store.get_project(task.project_id).await?;
            if project.map(|p| p.status) != Some(ProjectStatus::Active) {
                return Ok(DispatchOutcome::ProjectInactive);
            }

            let worker = match self
                .registry
                .select_idle(&required_capabilities(&task))
                .await
            {
                Ok(worker) => worker,
                Err(ForemanError::Registry(RegistryError::NoEligibleWorker)) => {
                    return Ok(DispatchOutcome::NoEligibleWorker)
                }
                Err(other) => return Err(other),
            };

            // Reserve: ready -> queued with the worker staged.
            let staged = match plan_transition(TransitionInput {
                task: &task,
                to: TaskStatus::Queued,
                actor: Actor::Pm,
                reason: Some("Scheduled by PM".to_string()),
                expected_version: task.version,
                dependencies: &[],
                stream_message_id: None,
                effects: TransitionEffects {
                    worker_id: Some(worker.id),
                    ..Default::default()
                },
                now: Utc::now(),
            }) {
                Ok(staged) => staged,
                // No longer ready; someone else moved it.
                Err(_) => return Ok(DispatchOutcome::Skipped),
            };

            match self
                .store
                .apply_transition(&staged.task, &staged.record)
                .await?
            {
                CasOutcome::Applied => {
                    return self.publish_and_record(staged.task, &worker).await;
                }
                CasOutcome::VersionMismatch { actual } => {
                    tracing::debug!(
                        task_id = %task.id,
                        attempt,
                        actual,
                        "Dispatch reservation lost a version race"
                    );
                    match self.store.get_task(task.id).await? {
                        Some(fresh) if fresh.status == TaskStatus::Ready => task = fresh,
                        _ => return Ok(DispatchOutcome::Skipped),
                    }
                }
                CasOutcome::NotFound => return Ok(DispatchOutcome::Skipped),
            }
        }

        Ok(DispatchOutcome::Skipped)
    }

    /// Publish the assignment and attach the returned message id to the
    /// reserved task. Every failure path here rolls back to `ready`.
    async fn publish_and_record(
        &self,
        queued: Task,
        worker: &Worker,
    ) -> Result<DispatchOutcome, ForemanError> {
        let assignment = AssignmentMessage {
            task_id: queued.id,
            project_id: queued.project_id,
            worker_id: worker.id,
            assigned_at: Utc::now(),
            branch_name: queued.branch_name.clone(),
            worker_prompt: queued.worker_prompt.clone(),
            qa_prompt: queued.qa_prompt.clone(),
            // The message-id attach below bumps the version once more; the
            // worker sees the task only after that, so it must expect the
            // post-attach version.
            expected_version: queued.version + 1,
        };
        let payload = serde_json::to_value(&assignment).map_err(|e| {
            ForemanError::Queue(QueueError::Unavailable {
                reason: format!("serialize assignment: {}", e),
            })
        })?;

        let stream = assign_stream(queued.project_id);
        let published =
            tokio::time::timeout(PUBLISH_TIMEOUT, self.queue.publish(&stream, &payload)).await;
        let message_id = match published {
            Ok(Ok(id)) => id,
            Ok(Err(err)) => {
                self.rollback(&queued).await;
                return Err(err.into());
            }
            Err(_) => {
                self.rollback(&queued).await;
                return Err(QueueError::Unavailable {
                    reason: format!("publish timed out after {:?}", PUBLISH_TIMEOUT),
                }
                .into());
            }
        };

        // Second CAS: attach the stream message id.
        let mut with_id = queued.clone();
        with_id.version += 1;
        with_id.assignment_message_id = Some(message_id.clone());
        with_id.updated_at = Utc::now();
        match self.store.update_task_fields(&with_id).await? {
            CasOutcome::Applied => {}
            _ => {
                // A concurrent mutation slid in between the two updates. The
                // published record is now orphaned; roll back and let the
                // version check on results reject it.
                self.rollback(&queued).await;
                return Ok(DispatchOutcome::Skipped);
            }
        }

        self.registry
            .set_current_task(worker.id, Some(with_id.id))
            .await?;

        self.bus.publish(
            with_id.project_id,
            BoardEvent::task_moved(with_id.id, TaskStatus::Ready, TaskStatus::Queued),
        );
        self.bus.publish(
            with_id.project_id,
            BoardEvent::worker_assigned(with_id.id, worker.id),
        );

        tracing::info!(
            task_id = %with_id.id,
            worker_id = %worker.id,
            message_id = %message_id,
            "Task dispatched"
        );
        Ok(DispatchOutcome::Dispatched(with_id))
    }

    /// Best-effort rollback `queued -> ready`, freeing the reservation.
    async fn rollback(&self, queued: &Task) {
        let staged = match plan_transition(TransitionInput {
            task: queued,
            to: TaskStatus::Ready,
            actor: Actor::Pm,
            reason: Some("Dispatch rolled back".to_string()),
            expected_version: queued.version,
            dependencies: &[],
            stream_message_id: None,
            effects: TransitionEffects::default(),
            now: Utc::now(),
        }) {
            Ok(staged) => staged,
            Err(err) => {
                tracing::warn!(task_id = %queued.id, error = %err, "Rollback not plannable");
                return;
            }
        };
        match self.store.apply_transition(&staged.task, &staged.record).await {
            Ok(CasOutcome::Applied) => {
                tracing::info!(task_id = %queued.id, "Dispatch rolled back to ready");
            }
            Ok(other) => {
                tracing::warn!(task_id = %queued.id, ?other, "Rollback lost a version race");
            }
            Err(err) => {
                tracing::error!(task_id = %queued.id, error = %err, "Rollback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::DEFAULT_DISPATCH_RETRIES;
    use foreman_core::{secret_digest, EntityIdType, RegistrationToken, TokenId};
    use foreman_queue::{GroupStart, InMemoryStreamQueue, GROUP_WORKERS};
    use foreman_store::{MemoryStore, PlanPhase, PlanTask, ProjectPlan};

    struct Fixture {
        store: MemoryStore,
        queue: InMemoryStreamQueue,
        dispatcher: Dispatcher,
        registry: Arc<WorkerRegistry>,
    }

    fn fixture() -> Fixture {
        let store = MemoryStore::new();
        let queue = InMemoryStreamQueue::new();
        let registry = Arc::new(WorkerRegistry::new(
            Arc::new(store.clone()),
            Duration::from_secs(30),
        ));
        let bus = Arc::new(BoardBus::new(64));
        let dispatcher = Dispatcher::new(
            Arc::new(store.clone()),
            Arc::new(queue.clone()),
            registry.clone(),
            bus,
            DEFAULT_DISPATCH_RETRIES,
        );
        Fixture {
            store,
            queue,
            dispatcher,
            registry,
        }
    }

    async fn seed_project(fix: &Fixture, active: bool) -> (foreman_core::ProjectId, Task) {
        let project = fix
            .store
            .create_project("p", "d", "/tmp/p")
            .await
            .unwrap();
        if active {
            fix.store
                .set_project_status(project.id, ProjectStatus::Active)
                .await
                .unwrap();
        }
        let plan = ProjectPlan {
            phases: vec![PlanPhase {
                name: "one".to_string(),
                description: None,
                branch_name: "phase/1".to_string(),
                tasks: vec![PlanTask {
                    key: "a".to_string(),
                    title: "task a".to_string(),
                    description: None,
                    priority: foreman_core::TaskPriority::Medium,
                    depends_on: vec![],
                    worker_prompt: None,
                    qa_prompt: None,
                    branch_name: None,
                }],
            }],
        };
        let (_, tasks) = fix.store.apply_plan(project.id, &plan).await.unwrap();
        (project.id, tasks.into_iter().next().unwrap())
    }

    async fn seed_worker(fix: &Fixture) -> Worker {
        let token = RegistrationToken {
            id: TokenId::now_v7(),
            token_digest: secret_digest("tok"),
            name: None,
            created_at: Utc::now(),
            expires_at: None,
            revoked: false,
            consumed_at: None,
        };
        fix.store.insert_token(&token).await.unwrap();
        fix.registry
            .register("tok", None, "linux".into(), vec![], "x".into())
            .await
            .unwrap()
            .worker
    }

    #[tokio::test]
    async fn test_dispatch_reserves_publishes_and_records() {
        let fix = fixture();
        let (project_id, task) = seed_project(&fix, true).await;
        let worker = seed_worker(&fix).await;

        let outcome = fix.dispatcher.dispatch(&task).await.unwrap();
        let dispatched = match outcome {
            DispatchOutcome::Dispatched(t) => t,
            other => panic!("expected dispatch, got {other:?}"),
        };

        assert_eq!(dispatched.status, TaskStatus::Queued);
        assert_eq!(dispatched.worker_id, Some(worker.id));
        // Reservation + message-id attach: two mutations, two version bumps.
        assert_eq!(dispatched.version, task.version + 2);
        let message_id = dispatched.assignment_message_id.clone().unwrap();

        // The assignment is on the project stream with matching payload.
        let stream = assign_stream(project_id);
        fix.queue
            .ensure_group(&stream, GROUP_WORKERS, GroupStart::Beginning)
            .await
            .unwrap();
        let batch = fix
            .queue
            .consume(&stream, GROUP_WORKERS, "w0", 10, 0)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, message_id);
        assert_eq!(batch[0].payload["task_id"], dispatched.id.to_string());
        // The advertised version matches the task as the worker will find it.
        assert_eq!(
            batch[0].payload["expected_version"].as_i64().unwrap(),
            dispatched.version
        );

        // Worker is attributed.
        let stored_worker = fix.store.get_worker(worker.id).await.unwrap().unwrap();
        assert_eq!(stored_worker.current_task_id, Some(dispatched.id));
    }

    #[tokio::test]
    async fn test_dispatch_without_worker_is_silent() {
        let fix = fixture();
        let (_, task) = seed_project(&fix, true).await;
        let outcome = fix.dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoEligibleWorker);

        let unchanged = fix.store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(unchanged.status, TaskStatus::Ready);
        assert_eq!(unchanged.version, task.version);
    }

    #[tokio::test]
    async fn test_dispatch_respects_project_status() {
        let fix = fixture();
        let (_, task) = seed_project(&fix, false).await;
        seed_worker(&fix).await;

        let outcome = fix.dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::ProjectInactive);
    }

    #[tokio::test]
    async fn test_concurrent_dispatch_is_taken_once() {
        let fix = fixture();
        let (_, task) = seed_project(&fix, true).await;
        seed_worker(&fix).await;

        let first = fix.dispatcher.dispatch(&task).await.unwrap();
        assert!(matches!(first, DispatchOutcome::Dispatched(_)));

        // Second dispatch with the stale snapshot loses the CAS, re-reads,
        // sees the task is no longer ready, and gives up silently.
        let second = fix.dispatcher.dispatch(&task).await.unwrap();
        assert_eq!(second, DispatchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_capability_filtering_selects_matching_worker() {
        let fix = fixture();
        let (_, mut task) = seed_project(&fix, true).await;
        seed_worker(&fix).await; // no capabilities

        task.worker_prompt = Some(serde_json::json!({
            "required_capabilities": ["gpu"]
        }));
        let mut with_caps = task.clone();
        with_caps.version += 1;
        fix.store.update_task_fields(&with_caps).await.unwrap();

        let outcome = fix.dispatcher.dispatch(&with_caps).await.unwrap();
        assert_eq!(outcome, DispatchOutcome::NoEligibleWorker);
    }
}
