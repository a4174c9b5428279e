//! Result Ingester
//!
//! Long-running consumer of `tasks:results` under the `ingesters` group.
//! Each message maps to one state-machine transition, applied under the
//! message's `expected_version`. At-least-once delivery makes duplicates
//! routine: a duplicate conflicts on the version check, is recognized by the
//! task already sitting in the target state, and is acknowledged without a
//! second effect.
//!
//! Ack policy: deterministic failures (illegal transition, missing
//! prerequisite, unparseable payload) are acknowledged and dead-lettered;
//! transient store/queue failures are NOT acknowledged so the message
//! redelivers.

use crate::constants::{BACKOFF_SCHEDULE_MS, DEFAULT_CONSUME_BLOCK_MS, DEFAULT_INGEST_BATCH};
use crate::events::{BoardBus, BoardEvent};
use crate::registry::WorkerRegistry;
use crate::services::orchestrator::PmSupervisor;
use crate::services::promote_dependents;
use crate::types::ResultMessage;
use chrono::Utc;
use foreman_core::{
    Actor, ForemanError, QueueError, RegistryError, ResultKind, StoreError, Task, TaskStatus,
    TransitionError,
};
use foreman_queue::{StreamMessage, StreamQueue, DLQ_STREAM, GROUP_INGESTERS, RESULTS_STREAM};
use foreman_state::{plan_transition, TransitionEffects, TransitionInput};
use foreman_store::{CasOutcome, Store};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// What became of one result message.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Transition applied; dependents promoted on `done`.
    Applied {
        task: Task,
        promoted: Vec<Task>,
    },
    /// Duplicate delivery: the task is already in the target state.
    AlreadyApplied,
    /// Sender failed verification; dropped to protect against replay.
    DroppedInvalidWorker,
    /// Deterministically un-applicable; recorded on `tasks:dlq`.
    DeadLettered,
    /// Conflict persisted across retries; the worker reconciles later.
    LostUpdate,
}

pub struct ResultIngester {
    store: Arc<dyn Store>,
    queue: Arc<dyn StreamQueue>,
    registry: Arc<WorkerRegistry>,
    bus: Arc<BoardBus>,
    supervisor: Option<Arc<PmSupervisor>>,
    retries: u32,
}

impl ResultIngester {
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
            supervisor: None,
            retries,
        }
    }

    /// Wire the PM supervisor so terminal transitions wake the project loop.
    pub fn with_supervisor(mut self, supervisor: Arc<PmSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    // ========================================================================
    // CONSUME LOOP
    // ========================================================================

    /// Run until the shutdown signal flips. One consumer of the `ingesters`
    /// group; run several copies under distinct consumer names to scale.
    pub async fn run(self: Arc<Self>, consumer: String, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(consumer = %consumer, "Result ingester started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                batch = self.queue.consume(
                    RESULTS_STREAM,
                    GROUP_INGESTERS,
                    &consumer,
                    DEFAULT_INGEST_BATCH,
                    DEFAULT_CONSUME_BLOCK_MS,
                ) => {
                    match batch {
                        Ok(messages) => {
                            for message in messages {
                                self.handle(&message).await;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(error = %err, "Results consume failed; backing off");
                            tokio::time::sleep(Duration::from_millis(BACKOFF_SCHEDULE_MS[0]))
                                .await;
                        }
                    }
                }
            }
        }
        tracing::info!(consumer = %consumer, "Result ingester stopped");
    }

    /// Process one delivery and apply the ack policy.
    pub async fn handle(&self, message: &StreamMessage) {
        match self.process(message).await {
            Ok(outcome) => {
                tracing::debug!(message_id = %message.id, ?outcome, "Result processed");
                if let Err(err) = self
                    .queue
                    .ack(RESULTS_STREAM, GROUP_INGESTERS, &message.id)
                    .await
                {
                    tracing::warn!(message_id = %message.id, error = %err, "Ack failed");
                }
            }
            Err(err) if is_retriable(&err) => {
                // No ack: the pending entry stays and redelivers.
                tracing::warn!(
                    message_id = %message.id,
                    error = %err,
                    "Transient failure; leaving message pending"
                );
            }
            Err(err) => {
                tracing::error!(
                    message_id = %message.id,
                    error = %err,
                    "Unexpected ingest failure; leaving message pending"
                );
            }
        }
    }

    // ========================================================================
    // MESSAGE PROCESSING
    // ========================================================================

    /// Validate, map and apply one result message. Transient failures bubble
    /// as errors (caller leaves the message pending); every `Ok` outcome is
    /// safe to acknowledge.
    pub async fn process(&self, message: &StreamMessage) -> Result<IngestOutcome, ForemanError> {
        let result: ResultMessage = match serde_json::from_value(message.payload.clone()) {
            Ok(result) => result,
            Err(err) => {
                self.dead_letter(message, &format!("malformed result: {}", err))
                    .await?;
                return Ok(IngestOutcome::DeadLettered);
            }
        };

        // Replay protection: results from unknown or revoked workers are
        // dropped after ack.
        match self
            .registry
            .verify(result.worker_id, &result.worker_secret)
            .await
        {
            Ok(_) => {}
            Err(ForemanError::Registry(
                RegistryError::WorkerNotFound(_) | RegistryError::InvalidSecret,
            )) => {
                tracing::warn!(
                    message_id = %message.id,
                    worker_id = %result.worker_id,
                    "Result from unverified worker dropped"
                );
                return Ok(IngestOutcome::DroppedInvalidWorker);
            }
            Err(other) => return Err(other),
        }

        for attempt in 0..self.retries {
            if attempt > 0 {
                // Conflicts are usually a concurrent writer mid-protocol
                // (e.g. the dispatcher attaching a message id); give it a
                // beat before re-reading.
                let backoff = BACKOFF_SCHEDULE_MS[(attempt as usize - 1).min(2)];
                tokio::time::sleep(Duration::from_millis(backoff)).await;
            }
            let Some(task) = self.store.get_task(result.task_id).await? else {
                self.dead_letter(message, "task does not exist").await?;
                return Ok(IngestOutcome::DeadLettered);
            };

            let (to, effects) = map_kind(&result, &task);
            let planned = plan_transition(TransitionInput {
                task: &task,
                to,
                actor: Actor::Worker(result.worker_id),
                reason: reason_for(&result),
                expected_version: result.expected_version,
                dependencies: &[],
                stream_message_id: Some(message.id.clone()),
                effects,
                now: Utc::now(),
            });

            let staged = match planned {
                Ok(staged) => staged,
                Err(TransitionError::VersionConflict { actual, .. }) => {
                    if task.status == to {
                        // Duplicate delivery of an already-applied result.
                        tracing::debug!(
                            task_id = %task.id,
                            message_id = %message.id,
                            "Duplicate result; already applied"
                        );
                        return Ok(IngestOutcome::AlreadyApplied);
                    }
                    tracing::debug!(
                        task_id = %task.id,
                        expected = result.expected_version,
                        actual,
                        "Result conflicts with newer task version"
                    );
                    continue;
                }
                Err(err @ TransitionError::IllegalTransition { .. })
                | Err(err @ TransitionError::MissingPrerequisite { .. })
                | Err(err @ TransitionError::DependencyNotSatisfied { .. }) => {
                    self.dead_letter(message, &err.to_string()).await?;
                    return Ok(IngestOutcome::DeadLettered);
                }
            };

            match self
                .store
                .apply_transition(&staged.task, &staged.record)
                .await?
            {
                CasOutcome::Applied => {
                    let from = staged.record.from_status;
                    return Ok(self.after_apply(&result, staged.task, from).await?);
                }
                CasOutcome::VersionMismatch { .. } => continue,
                CasOutcome::NotFound => {
                    self.dead_letter(message, "task vanished mid-apply").await?;
                    return Ok(IngestOutcome::DeadLettered);
                }
            }
        }

        tracing::warn!(
            task_id = %result.task_id,
            message_id = %message.id,
            expected_version = result.expected_version,
            "LostUpdate: conflict persisted across retries"
        );
        Ok(IngestOutcome::LostUpdate)
    }

    /// Post-commit bookkeeping: worker attribution, board fan-out, dependent
    /// promotion, PM wake-up.
    async fn after_apply(
        &self,
        result: &ResultMessage,
        task: Task,
        from: TaskStatus,
    ) -> Result<IngestOutcome, ForemanError> {
        match result.kind {
            ResultKind::Started => {
                self.registry
                    .set_current_task(result.worker_id, Some(task.id))
                    .await?;
            }
            ResultKind::QaAccept | ResultKind::QaReject | ResultKind::Error => {
                self.registry
                    .set_current_task(result.worker_id, None)
                    .await?;
            }
            ResultKind::Submitted => {}
        }

        self.bus.publish(
            task.project_id,
            BoardEvent::task_moved(task.id, from, task.status),
        );

        let promoted = if task.status == TaskStatus::Done {
            promote_dependents(&self.store, &self.bus, &task).await?
        } else {
            Vec::new()
        };

        // Done and rejected both free scheduling capacity.
        if matches!(task.status, TaskStatus::Done | TaskStatus::Rejected) {
            if let Some(supervisor) = &self.supervisor {
                supervisor.wake(task.project_id);
            }
        }

        Ok(IngestOutcome::Applied { task, promoted })
    }

    async fn dead_letter(
        &self,
        message: &StreamMessage,
        reason: &str,
    ) -> Result<(), ForemanError> {
        tracing::warn!(message_id = %message.id, reason, "Dead-lettering result");
        self.queue
            .publish(
                DLQ_STREAM,
                &json!({
                    "origin_stream": RESULTS_STREAM,
                    "origin_id": message.id,
                    "payload": message.payload,
                    "reason": reason,
                    "ts": Utc::now(),
                }),
            )
            .await?;
        Ok(())
    }
}

/// Map a result kind to the target state and staged side-effect fields.
fn map_kind(result: &ResultMessage, task: &Task) -> (TaskStatus, TransitionEffects) {
    match result.kind {
        ResultKind::Started => (
            TaskStatus::InProgress,
            TransitionEffects {
                worker_id: Some(result.worker_id),
                ..Default::default()
            },
        ),
        ResultKind::Submitted => (
            TaskStatus::Review,
            TransitionEffects {
                commit_hash: result.payload_str("commit_hash"),
                branch_name: result.payload_str("branch_name"),
                output_path: result.payload_str("output_path"),
                ..Default::default()
            },
        ),
        ResultKind::QaAccept => (
            TaskStatus::Done,
            TransitionEffects {
                qa_result: result.payload.get("qa_result").cloned(),
                // A QA verdict from a second worker records the reviewer.
                reviewer_id: (task.worker_id != Some(result.worker_id))
                    .then_some(result.worker_id),
                ..Default::default()
            },
        ),
        ResultKind::QaReject => (
            TaskStatus::Rejected,
            TransitionEffects {
                qa_result: result.payload.get("qa_result").cloned(),
                reviewer_id: (task.worker_id != Some(result.worker_id))
                    .then_some(result.worker_id),
                ..Default::default()
            },
        ),
        ResultKind::Error => (
            TaskStatus::Rejected,
            TransitionEffects {
                error_message: result
                    .payload_str("error_message")
                    .or_else(|| Some("worker reported an error".to_string())),
                ..Default::default()
            },
        ),
    }
}

fn reason_for(result: &ResultMessage) -> Option<String> {
    match result.kind {
        ResultKind::Started => None,
        ResultKind::Submitted => Some("Worker submitted output".to_string()),
        ResultKind::QaAccept => Some("QA passed".to_string()),
        ResultKind::QaReject => Some("QA rejected".to_string()),
        ResultKind::Error => result
            .payload_str("error_message")
            .map(|m| format!("Execution failed: {}", m)),
    }
}

fn is_retriable(err: &ForemanError) -> bool {
    matches!(
        err,
        ForemanError::Store(StoreError::Unavailable { .. })
            | ForemanError::Queue(QueueError::Unavailable { .. })
    )
}
