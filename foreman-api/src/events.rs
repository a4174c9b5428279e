//! Board Event Bus
//!
//! Process-local publish/subscribe keyed by project id. Every committed
//! state transition publishes here; the WebSocket layer subscribes per
//! project. Publishing is non-blocking: each subscriber has a bounded buffer
//! and the oldest events drop when a slow subscriber overflows it.

use chrono::{DateTime, Utc};
use foreman_core::{ProjectId, Task, TaskId, TaskStatus, WorkerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::broadcast;

// ============================================================================
// EVENT TYPES
// ============================================================================

/// A realtime board update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BoardEvent {
    /// A task changed column.
    TaskMoved {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
        ts: DateTime<Utc>,
    },
    /// A task's fields changed without a column move.
    TaskUpdated {
        task_id: TaskId,
        task: Box<Task>,
        ts: DateTime<Utc>,
    },
    /// A worker was reserved for a task.
    WorkerAssigned {
        task_id: TaskId,
        worker_id: WorkerId,
        ts: DateTime<Utc>,
    },
    /// Subscribers should refetch the whole board.
    Refresh { ts: DateTime<Utc> },
}

impl BoardEvent {
    /// Event name for logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            BoardEvent::TaskMoved { .. } => "task_moved",
            BoardEvent::TaskUpdated { .. } => "task_updated",
            BoardEvent::WorkerAssigned { .. } => "worker_assigned",
            BoardEvent::Refresh { .. } => "refresh",
        }
    }

    pub fn task_moved(task_id: TaskId, from: TaskStatus, to: TaskStatus) -> Self {
        BoardEvent::TaskMoved {
            task_id,
            from,
            to,
            ts: Utc::now(),
        }
    }

    pub fn worker_assigned(task_id: TaskId, worker_id: WorkerId) -> Self {
        BoardEvent::WorkerAssigned {
            task_id,
            worker_id,
            ts: Utc::now(),
        }
    }
}

// ============================================================================
// BUS
// ============================================================================

/// Per-project broadcast channels. Senders are created lazily on first
/// subscribe or publish and kept for the process lifetime (one entry per
/// project is small and bounded by the project count).
pub struct BoardBus {
    capacity: usize,
    channels: RwLock<HashMap<ProjectId, broadcast::Sender<BoardEvent>>>,
}

impl BoardBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender(&self, project_id: ProjectId) -> broadcast::Sender<BoardEvent> {
        if let Some(tx) = self.channels.read().expect("bus lock").get(&project_id) {
            return tx.clone();
        }
        let mut channels = self.channels.write().expect("bus lock");
        channels
            .entry(project_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Non-blocking publish. Events for projects with no subscribers are
    /// dropped; lagging subscribers lose the oldest buffered events.
    pub fn publish(&self, project_id: ProjectId, event: BoardEvent) {
        let tx = self.sender(project_id);
        match tx.send(event) {
            Ok(receivers) => {
                tracing::debug!(
                    project_id = %project_id,
                    receivers,
                    "Board event published"
                );
            }
            Err(broadcast::error::SendError(event)) => {
                tracing::trace!(
                    project_id = %project_id,
                    event_type = event.event_type(),
                    "No board subscribers"
                );
            }
        }
    }

    /// Subscribe to one project's events. Dropping the receiver cancels the
    /// subscription.
    pub fn subscribe(&self, project_id: ProjectId) -> broadcast::Receiver<BoardEvent> {
        self.sender(project_id).subscribe()
    }
}
