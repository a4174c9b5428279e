//! Error types for Foreman operations

use crate::{TaskId, TaskStatus};
use thiserror::Error;

/// State-machine transition errors.
///
/// `VersionConflict` and `IllegalTransition` are deterministic: retrying the
/// same request can never succeed. `DependencyNotSatisfied` clears once the
/// named dependencies complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("Illegal transition for task {task_id}: {from} -> {to}")]
    IllegalTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Version conflict on task {task_id}: expected {expected}, actual {actual}")]
    VersionConflict {
        task_id: TaskId,
        expected: i64,
        actual: i64,
    },

    #[error("Dependencies not satisfied for task {task_id}: {unmet:?} not done")]
    DependencyNotSatisfied { task_id: TaskId, unmet: Vec<TaskId> },

    #[error("Missing prerequisite for task {task_id} entering {to}: {requirement}")]
    MissingPrerequisite {
        task_id: TaskId,
        to: TaskStatus,
        requirement: &'static str,
    },
}

/// Durable store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Connection or serialization failure; retriable with backoff.
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    /// The compare-and-set expected version did not match. Never retried by
    /// the store itself.
    #[error("Version conflict: expected {expected}, actual {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Schema-level constraint violation (unique index, same-project check,
    /// dependency cycle detected at batch time).
    #[error("Constraint violated: {reason}")]
    Constraint { reason: String },
}

/// Stream queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// Transport failure; retriable with backoff.
    #[error("Queue unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Unknown consumer group '{group}' on stream '{stream}'")]
    NoSuchGroup { stream: String, group: String },

    #[error("Malformed payload on stream '{stream}' id {id}: {reason}")]
    MalformedPayload {
        stream: String,
        id: String,
        reason: String,
    },
}

/// Worker registry errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Registration token not recognized")]
    UnknownToken,

    #[error("Registration token already used")]
    TokenAlreadyUsed,

    #[error("Registration token expired")]
    TokenExpired,

    #[error("Registration token revoked")]
    TokenRevoked,

    #[error("Worker not found: {0}")]
    WorkerNotFound(crate::WorkerId),

    #[error("Worker secret does not match")]
    InvalidSecret,

    #[error("Worker {0} is executing a task")]
    WorkerBusy(crate::WorkerId),

    #[error("No idle worker satisfies the required capabilities")]
    NoEligibleWorker,
}

/// Master error type spanning all Foreman subsystems.
#[derive(Debug, Clone, Error)]
pub enum ForemanError {
    #[error("Transition error: {0}")]
    Transition(#[from] TransitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Result type alias for Foreman operations.
pub type ForemanResult<T> = Result<T, ForemanError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;

    #[test]
    fn test_transition_error_display() {
        let task_id = TaskId::nil();
        let err = TransitionError::IllegalTransition {
            task_id,
            from: TaskStatus::Done,
            to: TaskStatus::Ready,
        };
        let msg = err.to_string();
        assert!(msg.contains("done -> ready"));
    }

    #[test]
    fn test_master_error_from_parts() {
        let err: ForemanError = StoreError::Unavailable {
            reason: "connection refused".to_string(),
        }
        .into();
        assert!(matches!(err, ForemanError::Store(_)));

        let err: ForemanError = RegistryError::TokenAlreadyUsed.into();
        assert!(matches!(err, ForemanError::Registry(_)));
    }
}
