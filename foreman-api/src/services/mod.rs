//! Orchestration services: the PM loop, the dispatcher and the result
//! ingester, plus the dependency-promotion routine they share.

pub mod dispatcher;
pub mod ingester;
pub mod orchestrator;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use ingester::{IngestOutcome, ResultIngester};
pub use orchestrator::PmSupervisor;

use crate::events::{BoardBus, BoardEvent};
use chrono::Utc;
use foreman_core::{Actor, ForemanError, ProjectId, Task, TaskStatus};
use foreman_state::{plan_transition, unmet_dependencies, TransitionEffects, TransitionInput};
use foreman_store::Store;
use std::sync::Arc;

/// Move one `waiting` task to `ready` if every dependency is `done`.
/// Returns the promoted task, or `None` when dependencies are still open or
/// a concurrent actor got there first.
async fn try_promote(
    store: &Arc<dyn Store>,
    bus: &Arc<BoardBus>,
    task: &Task,
    reason: &str,
) -> Result<Option<Task>, ForemanError> {
    let dependencies = store.dependency_statuses(task.id).await?;
    if !unmet_dependencies(&dependencies).is_empty() {
        return Ok(None);
    }

    let staged = match plan_transition(TransitionInput {
        task,
        to: TaskStatus::Ready,
        actor: Actor::System,
        reason: Some(reason.to_string()),
        expected_version: task.version,
        dependencies: &dependencies,
        stream_message_id: None,
        effects: TransitionEffects::default(),
        now: Utc::now(),
    }) {
        Ok(staged) => staged,
        // Raced with another promoter or an admin action; not a failure.
        Err(_) => return Ok(None),
    };

    if !store
        .apply_transition(&staged.task, &staged.record)
        .await?
        .is_applied()
    {
        return Ok(None);
    }

    bus.publish(
        staged.task.project_id,
        BoardEvent::task_moved(staged.task.id, TaskStatus::Waiting, TaskStatus::Ready),
    );
    Ok(Some(staged.task))
}

/// Re-evaluate the tasks that depend on a finished task; promote those whose
/// dependency sets are now fully `done`.
pub async fn promote_dependents(
    store: &Arc<dyn Store>,
    bus: &Arc<BoardBus>,
    done_task: &Task,
) -> Result<Vec<Task>, ForemanError> {
    let mut promoted = Vec::new();
    for dependent in store.waiting_dependents(done_task.id).await? {
        let reason = format!("All dependencies met (triggered by task {})", done_task.id);
        if let Some(task) = try_promote(store, bus, &dependent, &reason).await? {
            promoted.push(task);
        }
    }
    Ok(promoted)
}

/// One readiness sweep over all `waiting` tasks of a project.
pub async fn promote_waiting(
    store: &Arc<dyn Store>,
    bus: &Arc<BoardBus>,
    project_id: ProjectId,
) -> Result<Vec<Task>, ForemanError> {
    let waiting = store
        .list_tasks(project_id, Some(&[TaskStatus::Waiting]))
        .await?;
    let mut promoted = Vec::new();
    for task in waiting {
        if let Some(task) = try_promote(store, bus, &task, "All dependencies met").await? {
            promoted.push(task);
        }
    }
    Ok(promoted)
}

/// Required capabilities of a task, read from the worker prompt's
/// `required_capabilities` array when present.
pub(crate) fn required_capabilities(task: &Task) -> Vec<String> {
    task.worker_prompt
        .as_ref()
        .and_then(|p| p.get("required_capabilities"))
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use foreman_core::{EntityIdType, PhaseId, TaskPriority};
    use serde_json::json;

    #[test]
    fn test_required_capabilities_parsing() {
        let mut task = Task::new_planned(
            ProjectId::now_v7(),
            PhaseId::now_v7(),
            "t".to_string(),
            TaskPriority::Medium,
            vec![],
            Utc::now(),
        );
        assert!(required_capabilities(&task).is_empty());

        task.worker_prompt = Some(json!({
            "instructions": "build it",
            "required_capabilities": ["rust", "sql"]
        }));
        assert_eq!(required_capabilities(&task), vec!["rust", "sql"]);

        task.worker_prompt = Some(json!({ "required_capabilities": "not-an-array" }));
        assert!(required_capabilities(&task).is_empty());
    }
}
