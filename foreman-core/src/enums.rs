//! Enum types for Foreman entities

use crate::WorkerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a status string from the database cannot be parsed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown {kind} value: {value}")]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

// ============================================================================
// PROJECT / PHASE STATUS
// ============================================================================

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Architect session in progress, no plan persisted yet
    #[default]
    Design,
    /// Orchestration may run
    Active,
    /// Orchestration halted; dispatched work still completes
    Paused,
    /// All tasks done
    Completed,
}

impl ProjectStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ProjectStatus::Design => "design",
            ProjectStatus::Active => "active",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Completed => "completed",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "design" => Ok(ProjectStatus::Design),
            "active" => Ok(ProjectStatus::Active),
            "paused" => Ok(ProjectStatus::Paused),
            "completed" => Ok(ProjectStatus::Completed),
            other => Err(EnumParseError {
                kind: "ProjectStatus",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Lifecycle status of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Active,
    Completed,
}

impl PhaseStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Active => "active",
            PhaseStatus::Completed => "completed",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "pending" => Ok(PhaseStatus::Pending),
            "active" => Ok(PhaseStatus::Active),
            "completed" => Ok(PhaseStatus::Completed),
            other => Err(EnumParseError {
                kind: "PhaseStatus",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// TASK STATUS / PRIORITY
// ============================================================================

/// Status of a task in the execution state machine.
///
/// The legal transitions between these states are defined by the state
/// machine crate; this enum is pure data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Has unmet dependencies
    #[default]
    Waiting,
    /// All dependencies done, eligible for dispatch
    Ready,
    /// Assignment published, not yet picked up
    Queued,
    /// A worker is executing
    InProgress,
    /// Worker submitted output, QA pending
    Review,
    /// QA accepted. Terminal.
    Done,
    /// Failed or QA-rejected; retryable
    Rejected,
    /// Administratively held
    Blocked,
}

impl TaskStatus {
    /// All statuses, in board-column order.
    pub const ALL: [TaskStatus; 8] = [
        TaskStatus::Waiting,
        TaskStatus::Ready,
        TaskStatus::Queued,
        TaskStatus::InProgress,
        TaskStatus::Review,
        TaskStatus::Done,
        TaskStatus::Rejected,
        TaskStatus::Blocked,
    ];

    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskStatus::Waiting => "waiting",
            TaskStatus::Ready => "ready",
            TaskStatus::Queued => "queued",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Review => "review",
            TaskStatus::Done => "done",
            TaskStatus::Rejected => "rejected",
            TaskStatus::Blocked => "blocked",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "waiting" => Ok(TaskStatus::Waiting),
            "ready" => Ok(TaskStatus::Ready),
            "queued" => Ok(TaskStatus::Queued),
            "in_progress" => Ok(TaskStatus::InProgress),
            "review" => Ok(TaskStatus::Review),
            "done" => Ok(TaskStatus::Done),
            "rejected" => Ok(TaskStatus::Rejected),
            "blocked" => Ok(TaskStatus::Blocked),
            other => Err(EnumParseError {
                kind: "TaskStatus",
                value: other.to_string(),
            }),
        }
    }

    /// Whether this status represents an in-flight assignment.
    pub fn has_open_assignment(&self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::InProgress | TaskStatus::Review
        )
    }

    /// Terminal statuses are never mutated again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Scheduling priority of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl TaskPriority {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskPriority::Low => "low",
            TaskPriority::Medium => "medium",
            TaskPriority::High => "high",
            TaskPriority::Critical => "critical",
        }
    }

    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        match s {
            "low" => Ok(TaskPriority::Low),
            "medium" => Ok(TaskPriority::Medium),
            "high" => Ok(TaskPriority::High),
            "critical" => Ok(TaskPriority::Critical),
            other => Err(EnumParseError {
                kind: "TaskPriority",
                value: other.to_string(),
            }),
        }
    }

    /// Scheduling rank: lower rank dispatches first (critical = 0).
    pub fn rank(&self) -> u8 {
        match self {
            TaskPriority::Critical => 0,
            TaskPriority::High => 1,
            TaskPriority::Medium => 2,
            TaskPriority::Low => 3,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// WORKER STATUS
// ============================================================================

/// Derived liveness status of a worker. Never persisted; computed on read
/// from `current_task_id` and `last_heartbeat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    Idle,
    Busy,
    Offline,
}

impl WorkerStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            WorkerStatus::Idle => "idle",
            WorkerStatus::Busy => "busy",
            WorkerStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

// ============================================================================
// RESULT KIND
// ============================================================================

/// Kind discriminator of a worker result message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(utoipa::ToSchema))]
#[serde(rename_all = "snake_case")]
pub enum ResultKind {
    /// Worker pulled the assignment and began execution
    Started,
    /// Worker finished and produced output for review
    Submitted,
    /// QA verdict: accepted
    QaAccept,
    /// QA verdict: rejected
    QaReject,
    /// Execution failed
    Error,
}

impl ResultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Started => "started",
            ResultKind::Submitted => "submitted",
            ResultKind::QaAccept => "qa_accept",
            ResultKind::QaReject => "qa_reject",
            ResultKind::Error => "error",
        }
    }
}

impl fmt::Display for ResultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// TRANSITION ACTOR
// ============================================================================

/// The party responsible for a state transition, recorded in the audit trail
/// as `"pm"`, `"worker:<id>"`, `"user"` or `"system"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Actor {
    Pm,
    Worker(WorkerId),
    User,
    System,
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Pm => f.write_str("pm"),
            Actor::Worker(id) => write!(f, "worker:{}", id),
            Actor::User => f.write_str("user"),
            Actor::System => f.write_str("system"),
        }
    }
}

impl FromStr for Actor {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pm" => Ok(Actor::Pm),
            "user" => Ok(Actor::User),
            "system" => Ok(Actor::System),
            other => {
                if let Some(id) = other.strip_prefix("worker:") {
                    if let Ok(worker_id) = id.parse() {
                        return Ok(Actor::Worker(worker_id));
                    }
                }
                Err(EnumParseError {
                    kind: "Actor",
                    value: other.to_string(),
                })
            }
        }
    }
}

impl Serialize for Actor {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Actor {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::EntityIdType;

    #[test]
    fn test_task_status_db_round_trip() {
        for status in TaskStatus::ALL {
            assert_eq!(TaskStatus::from_db_str(status.as_db_str()), Ok(status));
        }
        assert!(TaskStatus::from_db_str("bogus").is_err());
    }

    #[test]
    fn test_task_status_serde_matches_db_str() {
        for status in TaskStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_db_str()));
        }
    }

    #[test]
    fn test_priority_rank_ordering() {
        assert!(TaskPriority::Critical.rank() < TaskPriority::High.rank());
        assert!(TaskPriority::High.rank() < TaskPriority::Medium.rank());
        assert!(TaskPriority::Medium.rank() < TaskPriority::Low.rank());
    }

    #[test]
    fn test_open_assignment_statuses() {
        assert!(TaskStatus::Queued.has_open_assignment());
        assert!(TaskStatus::InProgress.has_open_assignment());
        assert!(TaskStatus::Review.has_open_assignment());
        assert!(!TaskStatus::Ready.has_open_assignment());
        assert!(!TaskStatus::Done.has_open_assignment());
    }

    #[test]
    fn test_actor_round_trip() {
        let worker = crate::WorkerId::now_v7();
        for actor in [Actor::Pm, Actor::User, Actor::System, Actor::Worker(worker)] {
            let s = actor.to_string();
            assert_eq!(s.parse::<Actor>().unwrap(), actor);
        }
        assert!("worker:not-a-uuid".parse::<Actor>().is_err());
    }
}
