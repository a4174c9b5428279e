//! End-to-end scenarios over the full service stack (memory store +
//! in-memory streams): linear chains, fan-out with priorities, optimistic
//! conflicts, worker crashes, duplicate results.

mod support;

use foreman_core::{Actor, ResultKind, TaskPriority, TaskStatus, WorkerStatus};
use foreman_queue::{StreamQueue, GROUP_INGESTERS, RESULTS_STREAM};
use foreman_state::{plan_transition, TransitionEffects, TransitionInput};
use foreman_store::{CasOutcome, Store};
use serde_json::json;
use std::time::Duration;
use support::{plan_task, single_phase_plan, spawn_happy_worker, Harness};

/// Scenario: A <- B <- C executed in order by one worker, everything `done`.
#[tokio::test]
async fn linear_chain_completes_in_dependency_order() {
    let harness = Harness::new().await;
    let (project_id, tasks) = harness
        .seed_project(&single_phase_plan(vec![
            plan_task("a", TaskPriority::Medium, &[]),
            plan_task("b", TaskPriority::Medium, &["a"]),
            plan_task("c", TaskPriority::Medium, &["b"]),
        ]))
        .await;

    let registered = harness.register_worker("solo", vec![]).await;
    let _ingester = harness.spawn_ingester();
    let _worker = spawn_happy_worker(
        &harness,
        registered,
        project_id,
        harness.shutdown_signal(),
    );

    harness.pm.start(project_id).await.unwrap();
    assert!(
        harness.wait_all_done(project_id, Duration::from_secs(20)).await,
        "linear chain must complete"
    );
    harness.stop();

    let order = harness.assignment_order(project_id).await;
    assert_eq!(order.len(), 3, "each task dispatched exactly once");
    assert_eq!(order[0], tasks["a"].id);
    assert_eq!(order[1], tasks["b"].id);
    assert_eq!(order[2], tasks["c"].id);

    // Invariant: a done task carries completed_at and no assignment.
    for task in tasks.values() {
        let stored = harness.task(task.id).await;
        assert_eq!(stored.status, TaskStatus::Done);
        assert!(stored.completed_at.is_some());
        assert!(stored.assignment_message_id.is_none());
        assert!(stored.worker_id.is_none());
    }
}

/// Scenario: fan-out A -> {B(high), C(low)} -> D. B dispatches before C; D
/// waits for both.
#[tokio::test]
async fn fan_out_respects_priority_and_join() {
    let harness = Harness::new().await;
    let (project_id, tasks) = harness
        .seed_project(&single_phase_plan(vec![
            plan_task("a", TaskPriority::Medium, &[]),
            plan_task("b", TaskPriority::High, &["a"]),
            plan_task("c", TaskPriority::Low, &["a"]),
            plan_task("d", TaskPriority::Medium, &["b", "c"]),
        ]))
        .await;

    // D starts waiting even though A is ready.
    assert_eq!(tasks["a"].status, TaskStatus::Ready);
    assert_eq!(tasks["d"].status, TaskStatus::Waiting);

    let registered = harness.register_worker("solo", vec![]).await;
    let _ingester = harness.spawn_ingester();
    let _worker = spawn_happy_worker(
        &harness,
        registered,
        project_id,
        harness.shutdown_signal(),
    );

    harness.pm.start(project_id).await.unwrap();
    assert!(
        harness.wait_all_done(project_id, Duration::from_secs(30)).await,
        "fan-out must complete"
    );
    harness.stop();

    let order = harness.assignment_order(project_id).await;
    assert_eq!(order.len(), 4);
    assert_eq!(order[0], tasks["a"].id, "A goes first");
    assert_eq!(order[3], tasks["d"].id, "D joins last");
    let b_pos = order.iter().position(|id| *id == tasks["b"].id).unwrap();
    let c_pos = order.iter().position(|id| *id == tasks["c"].id).unwrap();
    assert!(b_pos < c_pos, "high priority B dispatches before low C");

    // D became ready only after both B and C were done: its waiting->ready
    // record postdates both done records.
    let d_history = harness.store.list_transitions(tasks["d"].id).await.unwrap();
    let d_ready = d_history
        .iter()
        .find(|r| r.to_status == TaskStatus::Ready)
        .expect("D was promoted");
    for key in ["b", "c"] {
        let history = harness.store.list_transitions(tasks[key].id).await.unwrap();
        let done = history
            .iter()
            .find(|r| r.to_status == TaskStatus::Done)
            .expect("dependency finished");
        assert!(done.recorded_at <= d_ready.recorded_at);
    }
}

/// Scenario: two racing transitions with the same expected version; exactly
/// one wins, no duplicate audit record.
#[tokio::test]
async fn conflicting_transitions_apply_exactly_once() {
    let harness = Harness::new().await;
    let (_, tasks) = harness
        .seed_project(&single_phase_plan(vec![plan_task(
            "t",
            TaskPriority::Medium,
            &[],
        )]))
        .await;
    let registered = harness.register_worker("w", vec![]).await;

    // Drive the task into `rejected`: reserve, then cancel.
    let ready = harness.task(tasks["t"].id).await;
    let reserve = plan_transition(TransitionInput {
        task: &ready,
        to: TaskStatus::Queued,
        actor: Actor::Pm,
        reason: None,
        expected_version: ready.version,
        dependencies: &[],
        stream_message_id: None,
        effects: TransitionEffects {
            worker_id: Some(registered.worker.id),
            ..Default::default()
        },
        now: chrono::Utc::now(),
    })
    .unwrap();
    assert!(harness
        .store
        .apply_transition(&reserve.task, &reserve.record)
        .await
        .unwrap()
        .is_applied());

    let queued = harness.task(tasks["t"].id).await;
    let reject = plan_transition(TransitionInput {
        task: &queued,
        to: TaskStatus::Rejected,
        actor: Actor::User,
        reason: Some("cancelled".to_string()),
        expected_version: queued.version,
        dependencies: &[],
        stream_message_id: None,
        effects: TransitionEffects::default(),
        now: chrono::Utc::now(),
    })
    .unwrap();
    assert!(harness
        .store
        .apply_transition(&reject.task, &reject.record)
        .await
        .unwrap()
        .is_applied());

    // Two clients race rejected -> ready with the same snapshot.
    let rejected = harness.task(tasks["t"].id).await;
    let expected = rejected.version;
    let stage = |reason: &str| {
        plan_transition(TransitionInput {
            task: &rejected,
            to: TaskStatus::Ready,
            actor: Actor::User,
            reason: Some(reason.to_string()),
            expected_version: expected,
            dependencies: &[],
            stream_message_id: None,
            effects: TransitionEffects::default(),
            now: chrono::Utc::now(),
        })
        .unwrap()
    };
    let first = stage("retry A");
    let second = stage("retry B");

    let outcome_a = harness
        .store
        .apply_transition(&first.task, &first.record)
        .await
        .unwrap();
    let outcome_b = harness
        .store
        .apply_transition(&second.task, &second.record)
        .await
        .unwrap();

    assert!(outcome_a.is_applied());
    assert_eq!(
        outcome_b,
        CasOutcome::VersionMismatch {
            actual: expected + 1
        }
    );

    let final_task = harness.task(tasks["t"].id).await;
    assert_eq!(final_task.status, TaskStatus::Ready);
    assert_eq!(final_task.version, expected + 1);

    // Exactly one rejected->ready record exists.
    let history = harness.store.list_transitions(tasks["t"].id).await.unwrap();
    let retries = history
        .iter()
        .filter(|r| r.from_status == TaskStatus::Rejected && r.to_status == TaskStatus::Ready)
        .count();
    assert_eq!(retries, 1);
}

/// Scenario: the worker stops heart-beating mid-task. The worker goes
/// `offline`; the task stays `in_progress` with no spurious transition, and
/// the assignment is not redelivered.
#[tokio::test]
async fn crashed_worker_leaves_task_in_progress() {
    let harness = Harness::new().await;
    let (project_id, tasks) = harness
        .seed_project(&single_phase_plan(vec![plan_task(
            "t",
            TaskPriority::Medium,
            &[],
        )]))
        .await;
    let registered = harness.register_worker("doomed", vec![]).await;

    harness.pm.start(project_id).await.unwrap();
    harness.pm.queue_next(project_id).await.unwrap();

    // Worker pulls the assignment and reports started, then crashes.
    let assignments = harness.worker_poll(project_id, "doomed-0", 2_000).await;
    assert_eq!(assignments.len(), 1);
    let assignment = assignments[0];
    let outcome = harness
        .ingest_result(
            &registered,
            assignment.task_id,
            ResultKind::Started,
            assignment.expected_version,
            json!({}),
        )
        .await;
    assert!(matches!(outcome, foreman_api::IngestOutcome::Applied { .. }));

    // Silence: push the last heartbeat past two intervals.
    let stale = chrono::Utc::now() - chrono::Duration::seconds(61);
    harness
        .store
        .touch_worker(registered.worker.id, stale)
        .await
        .unwrap();

    let classified = harness.registry.list_classified().await.unwrap();
    let (_, status) = classified
        .iter()
        .find(|(w, _)| w.id == registered.worker.id)
        .unwrap();
    assert_eq!(*status, WorkerStatus::Offline);

    tokio::time::sleep(Duration::from_millis(200)).await;

    let task = harness.task(tasks["t"].id).await;
    assert_eq!(task.status, TaskStatus::InProgress, "no spurious transition");

    // The assignment is not redelivered to the worker group.
    let redelivered = harness.worker_poll(project_id, "doomed-1", 0).await;
    assert!(redelivered.is_empty());

    // Audit trail: exactly ready->queued and queued->in_progress.
    let history = harness.store.list_transitions(task.id).await.unwrap();
    assert_eq!(history.len(), 2);
    harness.stop();
}

/// Scenario: the same `submitted` result delivered twice changes state once.
#[tokio::test]
async fn duplicate_result_is_idempotent() {
    let harness = Harness::new().await;
    let (project_id, tasks) = harness
        .seed_project(&single_phase_plan(vec![plan_task(
            "t",
            TaskPriority::Medium,
            &[],
        )]))
        .await;
    let registered = harness.register_worker("w", vec![]).await;

    harness.pm.start(project_id).await.unwrap();
    harness.pm.queue_next(project_id).await.unwrap();
    let assignment = harness.worker_poll(project_id, "w-0", 2_000).await[0];

    harness
        .ingest_result(
            &registered,
            assignment.task_id,
            ResultKind::Started,
            assignment.expected_version,
            json!({}),
        )
        .await;

    let submitted_payload = json!({
        "commit_hash": "abc",
        "branch_name": "task/t",
        "output_path": "out/t",
    });
    let first = harness
        .ingest_result(
            &registered,
            assignment.task_id,
            ResultKind::Submitted,
            assignment.expected_version + 1,
            submitted_payload.clone(),
        )
        .await;
    assert!(matches!(first, foreman_api::IngestOutcome::Applied { .. }));
    let after_first = harness.task(tasks["t"].id).await;
    assert_eq!(after_first.status, TaskStatus::Review);

    // Same message again, same expected version.
    let second = harness
        .ingest_result(
            &registered,
            assignment.task_id,
            ResultKind::Submitted,
            assignment.expected_version + 1,
            submitted_payload,
        )
        .await;
    assert_eq!(second, foreman_api::IngestOutcome::AlreadyApplied);

    let after_second = harness.task(tasks["t"].id).await;
    assert_eq!(after_second.version, after_first.version, "no second bump");
    let review_records = harness
        .store
        .list_transitions(tasks["t"].id)
        .await
        .unwrap()
        .iter()
        .filter(|r| r.to_status == TaskStatus::Review)
        .count();
    assert_eq!(review_records, 1);
}

/// Round-trip law: start, pause, start leaves the same observable state as a
/// single start.
#[tokio::test]
async fn start_pause_start_is_idempotent() {
    let harness = Harness::new().await;
    let (project_id, _) = harness
        .seed_project(&single_phase_plan(vec![plan_task(
            "t",
            TaskPriority::Medium,
            &[],
        )]))
        .await;

    harness.pm.start(project_id).await.unwrap();
    assert!(harness.pm.is_running(project_id));

    harness.pm.pause(project_id).await.unwrap();
    let paused = harness.store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(paused.status, foreman_core::ProjectStatus::Paused);

    harness.pm.start(project_id).await.unwrap();
    assert!(harness.pm.is_running(project_id));
    let active = harness.store.get_project(project_id).await.unwrap().unwrap();
    assert_eq!(active.status, foreman_core::ProjectStatus::Active);

    // Starting again while running is a no-op.
    harness.pm.start(project_id).await.unwrap();
    let status = harness.pm.status(project_id).await.unwrap();
    assert!(status.running);
    harness.pm.pause(project_id).await.unwrap();
}

/// A project whose design was never finalized cannot be started.
#[tokio::test]
async fn starting_unfinalized_project_is_refused() {
    let harness = Harness::new().await;
    let project = harness
        .store
        .create_project("raw", "no plan yet", "/tmp/raw")
        .await
        .unwrap();

    let err = harness.pm.start(project.id).await.unwrap_err();
    assert_eq!(err.kind, foreman_api::ErrorCode::ProjectNotReady);
}

/// Backpressure: dispatch pauses above the high watermark and resumes after
/// the pending list drains below the low one.
#[tokio::test]
async fn backpressure_pauses_and_resumes_dispatch() {
    let mut config = foreman_api::OrchestratorConfig::development();
    config.backpressure_high = 2;
    config.backpressure_low = 1;
    let harness = Harness::with_config(config).await;

    let (project_id, tasks) = harness
        .seed_project(&single_phase_plan(vec![plan_task(
            "t",
            TaskPriority::Medium,
            &[],
        )]))
        .await;
    harness.register_worker("w", vec![]).await;

    // Saturate the results pending list with unacknowledged deliveries.
    let mut pending_ids = Vec::new();
    for n in 0..3 {
        let id = harness
            .queue
            .publish(RESULTS_STREAM, &json!({ "junk": n }))
            .await
            .unwrap();
        pending_ids.push(id);
    }
    harness
        .queue
        .consume(RESULTS_STREAM, GROUP_INGESTERS, "stuck", 16, 0)
        .await
        .unwrap();

    harness.pm.start(project_id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = harness.task(tasks["t"].id).await;
    assert_eq!(task.status, TaskStatus::Ready, "dispatch paused");

    // Drain below the low watermark.
    for id in &pending_ids {
        harness
            .queue
            .ack(RESULTS_STREAM, GROUP_INGESTERS, id)
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    let task = harness.task(tasks["t"].id).await;
    assert_eq!(task.status, TaskStatus::Queued, "dispatch resumed");
    harness.pm.pause(project_id).await.unwrap();
}
