//! Shared test harness: memory store + in-memory streams + full service
//! stack, with a scriptable worker.

#![allow(dead_code)]

use foreman_api::{
    BoardBus, IngestOutcome, OrchestratorConfig, PmSupervisor, Registered, ResultIngester,
    WorkerRegistry,
};
use foreman_core::{
    secret_digest, EntityIdType, ProjectId, ProjectStatus, RegistrationToken, ResultKind, Task,
    TaskId, TaskStatus, TokenId, WorkerId,
};
use foreman_queue::{
    assign_stream, GroupStart, InMemoryStreamQueue, StreamMessage, StreamQueue, GROUP_INGESTERS,
    GROUP_WORKERS, RESULTS_STREAM,
};
use foreman_store::{MemoryStore, PlanPhase, PlanTask, ProjectPlan, Store};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Harness {
    pub store: MemoryStore,
    pub queue: InMemoryStreamQueue,
    pub registry: Arc<WorkerRegistry>,
    pub bus: Arc<BoardBus>,
    pub pm: Arc<PmSupervisor>,
    pub ingester: Arc<ResultIngester>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(OrchestratorConfig::development()).await
    }

    pub async fn with_config(config: OrchestratorConfig) -> Self {
        let store = MemoryStore::new();
        let queue = InMemoryStreamQueue::new();
        queue
            .ensure_group(RESULTS_STREAM, GROUP_INGESTERS, GroupStart::Beginning)
            .await
            .unwrap();

        let store_arc: Arc<dyn Store> = Arc::new(store.clone());
        let queue_arc: Arc<dyn StreamQueue> = Arc::new(queue.clone());
        let registry = Arc::new(WorkerRegistry::new(
            store_arc.clone(),
            Duration::from_secs(30),
        ));
        let bus = Arc::new(BoardBus::new(256));
        let pm = Arc::new(PmSupervisor::new(
            store_arc.clone(),
            queue_arc.clone(),
            registry.clone(),
            bus.clone(),
            config,
        ));
        let ingester = Arc::new(
            ResultIngester::new(store_arc, queue_arc, registry.clone(), bus.clone(), 3)
                .with_supervisor(pm.clone()),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            store,
            queue,
            registry,
            bus,
            pm,
            ingester,
            shutdown,
        }
    }

    /// Spawn a live ingester consumer; stopped by `stop()`.
    pub fn spawn_ingester(&self) -> JoinHandle<()> {
        tokio::spawn(
            self.ingester
                .clone()
                .run("ingester-test".to_string(), self.shutdown.subscribe()),
        )
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    // ========================================================================
    // SEEDING
    // ========================================================================

    /// Create a project, apply the plan, and finalize it (paused).
    pub async fn seed_project(&self, plan: &ProjectPlan) -> (ProjectId, HashMap<String, Task>) {
        let project = self
            .store
            .create_project("demo", "demo project", "/tmp/demo")
            .await
            .unwrap();
        let (_, tasks) = self.store.apply_plan(project.id, plan).await.unwrap();
        self.store
            .set_project_status(project.id, ProjectStatus::Paused)
            .await
            .unwrap();
        let by_title = tasks.into_iter().map(|t| (t.title.clone(), t)).collect();
        (project.id, by_title)
    }

    pub async fn register_worker(&self, name: &str, capabilities: Vec<String>) -> Registered {
        let plaintext = format!("token-{}", name);
        let token = RegistrationToken {
            id: TokenId::now_v7(),
            token_digest: secret_digest(&plaintext),
            name: Some(name.to_string()),
            created_at: chrono::Utc::now(),
            expires_at: None,
            revoked: false,
            consumed_at: None,
        };
        self.store.insert_token(&token).await.unwrap();
        self.registry
            .register(
                &plaintext,
                Some(name.to_string()),
                "linux".to_string(),
                capabilities,
                "claude-code".to_string(),
            )
            .await
            .unwrap()
    }

    // ========================================================================
    // WORKER PROTOCOL
    // ========================================================================

    /// Pull and acknowledge assignments for a project, as a worker would.
    pub async fn worker_poll(
        &self,
        project_id: ProjectId,
        consumer: &str,
        block_ms: u64,
    ) -> Vec<Assignment> {
        let stream = assign_stream(project_id);
        self.queue
            .ensure_group(&stream, GROUP_WORKERS, GroupStart::Beginning)
            .await
            .unwrap();
        let batch = self
            .queue
            .consume(&stream, GROUP_WORKERS, consumer, 16, block_ms)
            .await
            .unwrap();
        let mut assignments = Vec::new();
        for message in batch {
            self.queue
                .ack(&stream, GROUP_WORKERS, &message.id)
                .await
                .unwrap();
            assignments.push(Assignment {
                task_id: message.payload["task_id"]
                    .as_str()
                    .unwrap()
                    .parse()
                    .unwrap(),
                expected_version: message.payload["expected_version"].as_i64().unwrap(),
            });
        }
        assignments
    }

    /// Publish a result message as the given worker.
    pub async fn send_result(
        &self,
        registered: &Registered,
        task_id: TaskId,
        kind: ResultKind,
        expected_version: i64,
        payload: JsonValue,
    ) -> StreamMessage {
        let message = json!({
            "task_id": task_id,
            "worker_id": registered.worker.id,
            "worker_secret": registered.worker_secret,
            "kind": kind,
            "payload": payload,
            "expected_version": expected_version,
            "ts": chrono::Utc::now(),
        });
        let id = self.queue.publish(RESULTS_STREAM, &message).await.unwrap();
        StreamMessage {
            id,
            payload: message,
        }
    }

    /// Publish a result and process it inline through the ingester (consume +
    /// handle + ack), returning the outcome.
    pub async fn ingest_result(
        &self,
        registered: &Registered,
        task_id: TaskId,
        kind: ResultKind,
        expected_version: i64,
        payload: JsonValue,
    ) -> IngestOutcome {
        self.send_result(registered, task_id, kind, expected_version, payload)
            .await;
        let mut last = None;
        for message in self
            .queue
            .consume(RESULTS_STREAM, GROUP_INGESTERS, "inline", 16, 0)
            .await
            .unwrap()
        {
            let outcome = self.ingester.process(&message).await.unwrap();
            self.queue
                .ack(RESULTS_STREAM, GROUP_INGESTERS, &message.id)
                .await
                .unwrap();
            last = Some(outcome);
        }
        last.expect("a freshly published result must be consumable")
    }

    // ========================================================================
    // OBSERVATION
    // ========================================================================

    pub async fn task(&self, id: TaskId) -> Task {
        self.store.get_task(id).await.unwrap().unwrap()
    }

    /// Poll until every task of the project is `done`, or time out.
    pub async fn wait_all_done(&self, project_id: ProjectId, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let counts = self.store.count_tasks_by_status(project_id).await.unwrap();
            let total: i64 = counts.values().sum();
            let done = counts.get(&TaskStatus::Done).copied().unwrap_or(0);
            if total > 0 && done == total {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Order in which tasks were assigned, from the project's stream.
    pub async fn assignment_order(&self, project_id: ProjectId) -> Vec<TaskId> {
        let stream = assign_stream(project_id);
        self.queue
            .ensure_group(&stream, "observer", GroupStart::Beginning)
            .await
            .unwrap();
        let batch = self
            .queue
            .consume(&stream, "observer", "observer-0", 256, 0)
            .await
            .unwrap();
        batch
            .iter()
            .map(|m| m.payload["task_id"].as_str().unwrap().parse().unwrap())
            .collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Assignment {
    pub task_id: TaskId,
    pub expected_version: i64,
}

/// Spawn a worker that happily executes every assignment: started,
/// submitted, qa_accept. Stops when `stop_rx` flips.
pub fn spawn_happy_worker(
    harness: &Harness,
    registered: Registered,
    project_id: ProjectId,
    mut stop_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let queue = harness.queue.clone();
    let consumer = format!("worker-{}", registered.worker.id);
    let harness_queue = queue.clone();
    let worker_id: WorkerId = registered.worker.id;
    let secret = registered.worker_secret.clone();

    tokio::spawn(async move {
        let stream = assign_stream(project_id);
        harness_queue
            .ensure_group(&stream, GROUP_WORKERS, GroupStart::Beginning)
            .await
            .unwrap();
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let batch = tokio::select! {
                _ = stop_rx.changed() => continue,
                batch = harness_queue.consume(&stream, GROUP_WORKERS, &consumer, 4, 50) => batch,
            };
            let Ok(batch) = batch else { break };
            for message in batch {
                let task_id: TaskId = message.payload["task_id"]
                    .as_str()
                    .unwrap()
                    .parse()
                    .unwrap();
                let version = message.payload["expected_version"].as_i64().unwrap();
                harness_queue
                    .ack(&stream, GROUP_WORKERS, &message.id)
                    .await
                    .unwrap();

                for (kind, expected, payload) in [
                    (ResultKind::Started, version, json!({})),
                    (
                        ResultKind::Submitted,
                        version + 1,
                        json!({
                            "commit_hash": format!("c-{}", task_id),
                            "branch_name": "task/auto",
                            "output_path": format!("out/{}", task_id),
                        }),
                    ),
                    (
                        ResultKind::QaAccept,
                        version + 2,
                        json!({ "qa_result": { "passed": true } }),
                    ),
                ] {
                    let result = json!({
                        "task_id": task_id,
                        "worker_id": worker_id,
                        "worker_secret": secret,
                        "kind": kind,
                        "payload": payload,
                        "expected_version": expected,
                        "ts": chrono::Utc::now(),
                    });
                    queue.publish(RESULTS_STREAM, &result).await.unwrap();
                    // Give the ingester time to apply before the next step
                    // depends on the bumped version.
                    tokio::time::sleep(Duration::from_millis(15)).await;
                }
            }
        }
    })
}

// ============================================================================
// PLAN BUILDERS
// ============================================================================

pub fn plan_task(key: &str, priority: foreman_core::TaskPriority, deps: &[&str]) -> PlanTask {
    PlanTask {
        key: key.to_string(),
        title: key.to_string(),
        description: None,
        priority,
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        worker_prompt: None,
        qa_prompt: None,
        branch_name: None,
    }
}

pub fn single_phase_plan(tasks: Vec<PlanTask>) -> ProjectPlan {
    ProjectPlan {
        phases: vec![PlanPhase {
            name: "phase-1".to_string(),
            description: None,
            branch_name: "phase/1".to_string(),
            tasks,
        }],
    }
}
