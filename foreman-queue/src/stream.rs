//! Stream queue trait and message types.

use async_trait::async_trait;
use foreman_core::{ProjectId, QueueError, WorkerId};
use serde_json::Value as JsonValue;

// ============================================================================
// STREAM NAMES
// ============================================================================

/// Result records produced by workers, consumed by the server ingesters.
pub const RESULTS_STREAM: &str = "tasks:results";

/// Dead-letter stream for deterministically un-applicable result messages.
pub const DLQ_STREAM: &str = "tasks:dlq";

/// Consumer group of the worker fleet on the per-project assignment streams.
pub const GROUP_WORKERS: &str = "workers";

/// Consumer group of the server-side result ingesters.
pub const GROUP_INGESTERS: &str = "ingesters";

/// Assignment stream for one project.
pub fn assign_stream(project_id: ProjectId) -> String {
    format!("tasks:assign:{}", project_id)
}

/// Per-worker control stream (cancel, drain).
pub fn control_stream(worker_id: WorkerId) -> String {
    format!("workers:control:{}", worker_id)
}

// ============================================================================
// MESSAGE TYPES
// ============================================================================

/// A message read from a stream. The id is assigned by the queue and is
/// monotonically increasing within the stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    pub id: String,
    pub payload: JsonValue,
}

/// One entry of a consumer group's pending list.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    /// Milliseconds since the last delivery to the owning consumer
    pub idle_ms: u64,
    pub delivery_count: u32,
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Replay the whole log ("0")
    Beginning,
    /// Only messages published after group creation ("$")
    New,
}

// ============================================================================
// TRAIT
// ============================================================================

/// Durable publish / consume / acknowledge over named logs with consumer
/// groups. All operations are safe to call from concurrent tasks.
#[async_trait]
pub trait StreamQueue: Send + Sync {
    /// Append a JSON payload; returns the assigned message id. At-least-once:
    /// a successful return means the message is durable.
    async fn publish(&self, stream: &str, payload: &JsonValue) -> Result<String, QueueError>;

    /// Idempotently create a consumer group on a stream, creating the stream
    /// if it does not exist yet.
    async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<(), QueueError>;

    /// Read up to `max` messages not yet delivered to this group, assigning
    /// them to `consumer`'s pending list. Blocks up to `block_ms` waiting for
    /// new messages; returns an empty batch on timeout.
    async fn consume(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        max: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, QueueError>;

    /// Acknowledge a delivered message. Returns `true` if the message was on
    /// the pending list; a second ack of the same id is a no-op (`false`).
    async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<bool, QueueError>;

    /// The group's current pending list.
    async fn pending(&self, stream: &str, group: &str) -> Result<Vec<PendingEntry>, QueueError>;

    /// Reassign pending messages whose owner has been idle at least
    /// `min_idle_ms` to `new_consumer`. Returns the reclaimed messages.
    async fn claim(
        &self,
        stream: &str,
        group: &str,
        new_consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, QueueError>;

    /// Drop the oldest entries of a stream beyond `max_len`. Returns the
    /// number of entries removed.
    async fn trim(&self, stream: &str, max_len: usize) -> Result<u64, QueueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::EntityIdType;

    #[test]
    fn test_stream_name_helpers() {
        let project_id = ProjectId::nil();
        assert_eq!(
            assign_stream(project_id),
            "tasks:assign:00000000-0000-0000-0000-000000000000"
        );
        let worker_id = WorkerId::nil();
        assert_eq!(
            control_stream(worker_id),
            "workers:control:00000000-0000-0000-0000-000000000000"
        );
    }
}
