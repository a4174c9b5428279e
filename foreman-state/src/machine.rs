//! Transition contract: validation and staged mutation.

use chrono::{DateTime, Utc};
use foreman_core::{
    Actor, EntityIdType, Task, TaskId, TaskStatus, TransitionError, TransitionId,
    TransitionRecord, WorkerId,
};
use serde_json::Value as JsonValue;

// ============================================================================
// LEGAL TRANSITIONS
// ============================================================================

/// The complete set of legal `(from, to)` transition pairs.
///
/// `queued -> ready` is the dispatcher rollback path (publish failed after
/// reservation), and `queued -> rejected` covers cancellation and worker
/// errors that arrive before execution starts. `done` is terminal.
pub const LEGAL_TRANSITIONS: &[(TaskStatus, TaskStatus)] = &[
    (TaskStatus::Waiting, TaskStatus::Ready),
    (TaskStatus::Ready, TaskStatus::Queued),
    (TaskStatus::Queued, TaskStatus::InProgress),
    (TaskStatus::Queued, TaskStatus::Ready),
    (TaskStatus::Queued, TaskStatus::Rejected),
    (TaskStatus::InProgress, TaskStatus::Review),
    (TaskStatus::InProgress, TaskStatus::Rejected),
    (TaskStatus::Review, TaskStatus::Done),
    (TaskStatus::Review, TaskStatus::Rejected),
    (TaskStatus::Rejected, TaskStatus::Ready),
    (TaskStatus::Waiting, TaskStatus::Blocked),
    (TaskStatus::Ready, TaskStatus::Blocked),
    (TaskStatus::Blocked, TaskStatus::Ready),
];

/// Check whether `(from, to)` is in the legal-transitions set.
pub fn is_legal(from: TaskStatus, to: TaskStatus) -> bool {
    LEGAL_TRANSITIONS.contains(&(from, to))
}

// ============================================================================
// TRANSITION INPUT / OUTPUT
// ============================================================================

/// Side-effect fields staged alongside a transition.
///
/// Callers stage only what the target state needs; unrelated fields are left
/// `None` and preserved from the current task state.
#[derive(Debug, Clone, Default)]
pub struct TransitionEffects {
    pub worker_id: Option<WorkerId>,
    pub reviewer_id: Option<WorkerId>,
    pub assignment_message_id: Option<String>,
    pub branch_name: Option<String>,
    pub commit_hash: Option<String>,
    pub output_path: Option<String>,
    pub qa_result: Option<JsonValue>,
    pub error_message: Option<String>,
}

/// Everything `plan_transition` needs to decide and stage a transition.
#[derive(Debug, Clone)]
pub struct TransitionInput<'a> {
    /// Current task snapshot
    pub task: &'a Task,
    /// Proposed target state
    pub to: TaskStatus,
    pub actor: Actor,
    pub reason: Option<String>,
    /// Caller's view of the task version; must match exactly
    pub expected_version: i64,
    /// Current statuses of the task's dependencies
    pub dependencies: &'a [(TaskId, TaskStatus)],
    /// Stream message id that triggered this transition, if any
    pub stream_message_id: Option<String>,
    pub effects: TransitionEffects,
    pub now: DateTime<Utc>,
}

/// The staged mutation: the new task state (version already incremented) and
/// the audit record. The store applies both atomically, keyed on the old
/// version.
#[derive(Debug, Clone)]
pub struct StagedTransition {
    pub task: Task,
    pub record: TransitionRecord,
}

// ============================================================================
// DEPENDENCY READINESS
// ============================================================================

/// Return the dependency ids that are not yet `done`.
pub fn unmet_dependencies(dependencies: &[(TaskId, TaskStatus)]) -> Vec<TaskId> {
    dependencies
        .iter()
        .filter(|(_, status)| *status != TaskStatus::Done)
        .map(|(id, _)| *id)
        .collect()
}

// ============================================================================
// TRANSITION PLANNING
// ============================================================================

/// Validate a proposed transition and stage the resulting mutation.
///
/// Validation order: (a) legal pair, (b) version, (c) target-state
/// preconditions. The returned task has `version` incremented by exactly 1.
pub fn plan_transition(input: TransitionInput<'_>) -> Result<StagedTransition, TransitionError> {
    let task = input.task;
    let from = task.status;
    let to = input.to;

    // (a) transition pair
    if !is_legal(from, to) {
        return Err(TransitionError::IllegalTransition {
            task_id: task.id,
            from,
            to,
        });
    }

    // (b) version
    if input.expected_version != task.version {
        return Err(TransitionError::VersionConflict {
            task_id: task.id,
            expected: input.expected_version,
            actual: task.version,
        });
    }

    // (c) state-specific preconditions
    check_preconditions(task, to, input.dependencies, &input.effects)?;

    let mut next = task.clone();
    next.status = to;
    next.version = task.version + 1;
    next.updated_at = input.now;
    apply_effects(&mut next, from, to, &input.effects, input.now);

    let record = TransitionRecord {
        id: TransitionId::now_v7(),
        task_id: task.id,
        from_status: from,
        to_status: to,
        actor: input.actor,
        reason: input.reason,
        stream_message_id: input.stream_message_id,
        recorded_at: input.now,
    };

    Ok(StagedTransition { task: next, record })
}

fn check_preconditions(
    task: &Task,
    to: TaskStatus,
    dependencies: &[(TaskId, TaskStatus)],
    effects: &TransitionEffects,
) -> Result<(), TransitionError> {
    match to {
        TaskStatus::Ready => {
            let unmet = unmet_dependencies(dependencies);
            if !unmet.is_empty() {
                return Err(TransitionError::DependencyNotSatisfied {
                    task_id: task.id,
                    unmet,
                });
            }
        }
        TaskStatus::Queued => {
            // The dispatcher reserves with a staged worker; the assignment
            // message id is attached by its follow-up update before the
            // assignment becomes consumable.
            if effects.worker_id.is_none() && effects.assignment_message_id.is_none() {
                return Err(TransitionError::MissingPrerequisite {
                    task_id: task.id,
                    to,
                    requirement: "staged worker assignment",
                });
            }
        }
        TaskStatus::InProgress => {
            if task.worker_id.is_none() && effects.worker_id.is_none() {
                return Err(TransitionError::MissingPrerequisite {
                    task_id: task.id,
                    to,
                    requirement: "assigned worker id",
                });
            }
        }
        TaskStatus::Review => {
            let has_payload = effects.output_path.is_some()
                || effects.commit_hash.is_some()
                || effects.branch_name.is_some();
            if !has_payload {
                return Err(TransitionError::MissingPrerequisite {
                    task_id: task.id,
                    to,
                    requirement: "non-empty result payload",
                });
            }
        }
        TaskStatus::Done => {
            if effects.qa_result.is_none() && task.qa_result.is_none() {
                return Err(TransitionError::MissingPrerequisite {
                    task_id: task.id,
                    to,
                    requirement: "qa acceptance result",
                });
            }
        }
        TaskStatus::Waiting | TaskStatus::Rejected | TaskStatus::Blocked => {}
    }
    Ok(())
}

fn apply_effects(
    next: &mut Task,
    from: TaskStatus,
    to: TaskStatus,
    effects: &TransitionEffects,
    now: DateTime<Utc>,
) {
    match to {
        TaskStatus::Queued => {
            if let Some(worker_id) = effects.worker_id {
                next.worker_id = Some(worker_id);
            }
            if let Some(message_id) = &effects.assignment_message_id {
                next.assignment_message_id = Some(message_id.clone());
            }
        }
        TaskStatus::InProgress => {
            if let Some(worker_id) = effects.worker_id {
                next.worker_id = Some(worker_id);
            }
            // started_at is set on first entry only
            if next.started_at.is_none() {
                next.started_at = Some(now);
            }
        }
        TaskStatus::Review => {
            if let Some(reviewer_id) = effects.reviewer_id {
                next.reviewer_id = Some(reviewer_id);
            }
            if let Some(output_path) = &effects.output_path {
                next.output_path = Some(output_path.clone());
            }
            if let Some(commit_hash) = &effects.commit_hash {
                next.commit_hash = Some(commit_hash.clone());
            }
            if let Some(branch_name) = &effects.branch_name {
                next.branch_name = Some(branch_name.clone());
            }
        }
        TaskStatus::Done => {
            if let Some(reviewer_id) = effects.reviewer_id {
                next.reviewer_id = Some(reviewer_id);
            }
            if let Some(qa_result) = &effects.qa_result {
                next.qa_result = Some(qa_result.clone());
            }
            next.completed_at = Some(now);
            next.worker_id = None;
            next.assignment_message_id = None;
        }
        TaskStatus::Rejected => {
            if let Some(reviewer_id) = effects.reviewer_id {
                next.reviewer_id = Some(reviewer_id);
            }
            if let Some(qa_result) = &effects.qa_result {
                next.qa_result = Some(qa_result.clone());
            }
            if let Some(error_message) = &effects.error_message {
                next.error_message = Some(error_message.clone());
            }
            next.worker_id = None;
            next.assignment_message_id = None;
        }
        TaskStatus::Ready => {
            if from == TaskStatus::Queued {
                // Dispatcher rollback frees the reservation.
                next.worker_id = None;
                next.assignment_message_id = None;
            }
        }
        TaskStatus::Waiting | TaskStatus::Blocked => {}
    }
}
