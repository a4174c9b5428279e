//! Ready-task tie-break ordering.

use foreman_core::{EntityIdType, Task};
use std::cmp::Ordering;

/// Deterministic order for picking among simultaneously ready tasks:
/// `(priority desc, created_at asc, id asc)`.
pub fn ready_order(a: &Task, b: &Task) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.id.as_uuid().cmp(&b.id.as_uuid()))
}

/// Sort a batch of ready tasks into dispatch order.
pub fn sort_ready(tasks: &mut [Task]) {
    tasks.sort_by(ready_order);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use foreman_core::{PhaseId, ProjectId, TaskPriority};

    fn task(priority: TaskPriority, age_secs: i64) -> Task {
        Task::new_planned(
            ProjectId::nil(),
            PhaseId::nil(),
            "t".to_string(),
            priority,
            vec![],
            Utc::now() - Duration::seconds(age_secs),
        )
    }

    #[test]
    fn test_priority_wins_over_age() {
        let old_low = task(TaskPriority::Low, 1000);
        let new_critical = task(TaskPriority::Critical, 0);
        assert_eq!(ready_order(&new_critical, &old_low), Ordering::Less);
    }

    #[test]
    fn test_age_breaks_priority_ties() {
        let older = task(TaskPriority::High, 60);
        let newer = task(TaskPriority::High, 0);
        assert_eq!(ready_order(&older, &newer), Ordering::Less);
    }

    #[test]
    fn test_id_breaks_full_ties() {
        let now = Utc::now();
        let mut a = task(TaskPriority::Medium, 0);
        let mut b = task(TaskPriority::Medium, 0);
        a.created_at = now;
        b.created_at = now;
        let expected = a.id.as_uuid().cmp(&b.id.as_uuid());
        assert_eq!(ready_order(&a, &b), expected);
    }

    #[test]
    fn test_sort_ready_is_stable_dispatch_order() {
        let mut tasks = vec![
            task(TaskPriority::Low, 0),
            task(TaskPriority::Critical, 0),
            task(TaskPriority::Medium, 50),
            task(TaskPriority::Medium, 10),
        ];
        sort_ready(&mut tasks);
        assert_eq!(tasks[0].priority, TaskPriority::Critical);
        assert_eq!(tasks[1].priority, TaskPriority::Medium);
        assert!(tasks[1].created_at < tasks[2].created_at);
        assert_eq!(tasks[3].priority, TaskPriority::Low);
    }
}
