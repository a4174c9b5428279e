//! Property-Based Tests for the Task State Machine
//!
//! **Property 1: Version discipline.** Any accepted transition increments the
//! task version by exactly 1, and any request whose expected version differs
//! from the actual version is refused without effect.
//!
//! **Property 2: Audit validity.** The record produced by an accepted
//! transition always carries a pair from the legal-transitions set.
//!
//! **Property 3: Deterministic dispatch order.** Sorting a set of ready tasks
//! is total and produces the same order regardless of input permutation.

use chrono::{Duration, Utc};
use foreman_core::{
    Actor, EntityIdType, PhaseId, ProjectId, Task, TaskId, TaskPriority, TaskStatus, WorkerId,
};
use foreman_state::{
    is_legal, plan_transition, sort_ready, TransitionEffects, TransitionInput, LEGAL_TRANSITIONS,
};
use proptest::prelude::*;
use serde_json::json;

// ============================================================================
// STRATEGIES
// ============================================================================

fn status_strategy() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

fn priority_strategy() -> impl Strategy<Value = TaskPriority> {
    prop::sample::select(vec![
        TaskPriority::Low,
        TaskPriority::Medium,
        TaskPriority::High,
        TaskPriority::Critical,
    ])
}

fn legal_pair_strategy() -> impl Strategy<Value = (TaskStatus, TaskStatus)> {
    prop::sample::select(LEGAL_TRANSITIONS.to_vec())
}

/// A task in `status` whose fields satisfy every state's entry preconditions
/// when combined with `full_effects()`.
fn task_in(status: TaskStatus, version: i64) -> Task {
    let mut task = Task::new_planned(
        ProjectId::now_v7(),
        PhaseId::now_v7(),
        "prop-task".to_string(),
        TaskPriority::Medium,
        vec![],
        Utc::now(),
    );
    task.status = status;
    task.version = version;
    task.worker_id = Some(WorkerId::now_v7());
    task
}

/// Effects that satisfy every target-state precondition at once.
fn full_effects() -> TransitionEffects {
    TransitionEffects {
        worker_id: Some(WorkerId::now_v7()),
        reviewer_id: None,
        assignment_message_id: Some("0000000000042-000001".to_string()),
        branch_name: Some("task/prop".to_string()),
        commit_hash: Some("deadbeef".to_string()),
        output_path: Some("out/prop".to_string()),
        qa_result: Some(json!({"passed": true})),
        error_message: None,
    }
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #[test]
    fn prop_accepted_transition_bumps_version_by_one(
        (from, to) in legal_pair_strategy(),
        version in 1i64..1_000_000,
    ) {
        let task = task_in(from, version);
        let staged = plan_transition(TransitionInput {
            task: &task,
            to,
            actor: Actor::System,
            reason: None,
            expected_version: version,
            dependencies: &[],
            stream_message_id: None,
            effects: full_effects(),
            now: Utc::now(),
        });
        let staged = staged.expect("legal pair with satisfied preconditions must be accepted");
        prop_assert_eq!(staged.task.version, version + 1);
    }

    #[test]
    fn prop_version_mismatch_is_always_refused(
        (from, to) in legal_pair_strategy(),
        version in 1i64..1_000,
        skew in 1i64..1_000,
    ) {
        let task = task_in(from, version);
        let result = plan_transition(TransitionInput {
            task: &task,
            to,
            actor: Actor::Pm,
            reason: None,
            expected_version: version + skew,
            dependencies: &[],
            stream_message_id: None,
            effects: full_effects(),
            now: Utc::now(),
        });
        prop_assert!(result.is_err());
    }

    #[test]
    fn prop_record_pair_is_always_legal(
        (from, to) in legal_pair_strategy(),
    ) {
        let task = task_in(from, 1);
        let staged = plan_transition(TransitionInput {
            task: &task,
            to,
            actor: Actor::User,
            reason: Some("prop".to_string()),
            expected_version: 1,
            dependencies: &[],
            stream_message_id: None,
            effects: full_effects(),
            now: Utc::now(),
        })
        .expect("legal pair accepted");
        prop_assert!(is_legal(staged.record.from_status, staged.record.to_status));
    }

    #[test]
    fn prop_illegal_pairs_are_refused(
        from in status_strategy(),
        to in status_strategy(),
    ) {
        prop_assume!(!is_legal(from, to));
        let task = task_in(from, 1);
        let result = plan_transition(TransitionInput {
            task: &task,
            to,
            actor: Actor::System,
            reason: None,
            expected_version: 1,
            dependencies: &[],
            stream_message_id: None,
            effects: full_effects(),
            now: Utc::now(),
        });
        prop_assert!(result.is_err());
    }

    #[test]
    fn prop_ready_with_unmet_dependency_is_refused(
        version in 1i64..100,
    ) {
        let task = task_in(TaskStatus::Waiting, version);
        let dep = TaskId::now_v7();
        let deps = [(dep, TaskStatus::InProgress)];
        let result = plan_transition(TransitionInput {
            task: &task,
            to: TaskStatus::Ready,
            actor: Actor::System,
            reason: None,
            expected_version: version,
            dependencies: &deps,
            stream_message_id: None,
            effects: TransitionEffects::default(),
            now: Utc::now(),
        });
        prop_assert!(result.is_err());
    }

    #[test]
    fn prop_sort_ready_is_permutation_invariant(
        seed in prop::collection::vec((priority_strategy(), 0i64..3600), 1..24),
        rotation in 0usize..24,
    ) {
        let base = Utc::now();
        let tasks: Vec<Task> = seed
            .iter()
            .map(|(priority, age)| {
                Task::new_planned(
                    ProjectId::nil(),
                    PhaseId::nil(),
                    "p".to_string(),
                    *priority,
                    vec![],
                    base - Duration::seconds(*age),
                )
            })
            .collect();

        let mut sorted_once = tasks.clone();
        sort_ready(&mut sorted_once);

        let mut rotated = tasks;
        let len = rotated.len();
        rotated.rotate_left(rotation % len);
        sort_ready(&mut rotated);

        let ids_a: Vec<TaskId> = sorted_once.iter().map(|t| t.id).collect();
        let ids_b: Vec<TaskId> = rotated.iter().map(|t| t.id).collect();
        prop_assert_eq!(ids_a, ids_b);
    }
}
