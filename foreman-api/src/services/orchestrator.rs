//! PM Orchestrator
//!
//! One supervised loop per `active` project. The loop wakes on a periodic
//! tick, on a wake signal from the ingester (a task reached `done` or
//! `rejected`), or on a manual queue-next, then scans `ready` tasks in
//! tie-break order and dispatches up to the in-flight caps.
//!
//! The supervisor map `project_id -> handle` is the only shared state; the
//! project's status field in the store is the durable truth of whether a
//! loop should be running. The loop is cooperative: pause is honoured at the
//! next suspension point, and already-dispatched tasks proceed.

use crate::config::OrchestratorConfig;
use crate::constants::DEFAULT_DISPATCH_RETRIES;
use crate::error::{ApiError, ApiResult};
use crate::events::BoardBus;
use crate::registry::WorkerRegistry;
use crate::services::dispatcher::{DispatchOutcome, Dispatcher};
use crate::services::promote_waiting;
use crate::types::{PmStatusResponse, WorkerCounts};
use foreman_core::{
    ForemanError, PhaseId, ProjectId, ProjectStatus, Task, TaskStatus, WorkerStatus,
};
use foreman_queue::{StreamQueue, GROUP_INGESTERS, RESULTS_STREAM};
use foreman_state::sort_ready;
use foreman_store::Store;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// In-flight statuses counted against the dispatch caps.
const IN_FLIGHT: [TaskStatus; 3] = [
    TaskStatus::Queued,
    TaskStatus::InProgress,
    TaskStatus::Review,
];

struct LoopHandle {
    shutdown: watch::Sender<bool>,
    wake: Arc<Notify>,
    handle: JoinHandle<()>,
}

/// Supervises one PM loop per active project.
pub struct PmSupervisor {
    store: Arc<dyn Store>,
    queue: Arc<dyn StreamQueue>,
    registry: Arc<WorkerRegistry>,
    bus: Arc<BoardBus>,
    dispatcher: Arc<Dispatcher>,
    config: OrchestratorConfig,
    loops: Mutex<HashMap<ProjectId, LoopHandle>>,
}

impl PmSupervisor {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn StreamQueue>,
        registry: Arc<WorkerRegistry>,
        bus: Arc<BoardBus>,
        config: OrchestratorConfig,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            queue.clone(),
            registry.clone(),
            bus.clone(),
            DEFAULT_DISPATCH_RETRIES,
        ));
        Self {
            store,
            queue,
            registry,
            bus,
            dispatcher,
            config,
            loops: Mutex::new(HashMap::new()),
        }
    }

    // ========================================================================
    // CONTROL API
    // ========================================================================

    /// Transition the project to `active` and spawn its loop if absent.
    /// Starting an already-running project is a no-op.
    pub async fn start(&self, project_id: ProjectId) -> ApiResult<()> {
        let project = self
            .store
            .get_project(project_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("project", project_id))?;

        match project.status {
            ProjectStatus::Design => {
                return Err(ApiError::project_not_ready(
                    "Project design has not been finalized",
                ))
            }
            ProjectStatus::Completed => {
                return Err(ApiError::state_conflict("Project is completed"))
            }
            ProjectStatus::Active | ProjectStatus::Paused => {}
        }

        self.store
            .set_project_status(project_id, ProjectStatus::Active)
            .await
            .map_err(ApiError::from)?;

        let mut loops = self.loops.lock().expect("supervisor lock");
        if let Some(existing) = loops.get(&project_id) {
            if !existing.handle.is_finished() {
                tracing::debug!(project_id = %project_id, "PM loop already running");
                return Ok(());
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let wake = Arc::new(Notify::new());
        let handle = tokio::spawn(pm_loop(
            self.store.clone(),
            self.queue.clone(),
            self.dispatcher.clone(),
            self.bus.clone(),
            self.config.clone(),
            project_id,
            shutdown_rx,
            wake.clone(),
        ));
        loops.insert(
            project_id,
            LoopHandle {
                shutdown: shutdown_tx,
                wake,
                handle,
            },
        );
        tracing::info!(project_id = %project_id, "PM loop started");
        Ok(())
    }

    /// Set the project `paused` and signal its loop to exit after the
    /// current iteration. Dispatched work proceeds and its results are
    /// ingested normally.
    pub async fn pause(&self, project_id: ProjectId) -> ApiResult<()> {
        let project = self
            .store
            .get_project(project_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("project", project_id))?;
        if project.status == ProjectStatus::Active {
            self.store
                .set_project_status(project_id, ProjectStatus::Paused)
                .await
                .map_err(ApiError::from)?;
        }

        if let Some(handle) = self.loops.lock().expect("supervisor lock").remove(&project_id) {
            let _ = handle.shutdown.send(true);
            handle.wake.notify_one();
            tracing::info!(project_id = %project_id, "PM loop signalled to stop");
        }
        Ok(())
    }

    /// Orchestration status: loop liveness, worker liveness counts, task
    /// counts by status.
    pub async fn status(&self, project_id: ProjectId) -> ApiResult<PmStatusResponse> {
        self.store
            .get_project(project_id)
            .await
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::not_found("project", project_id))?;

        let running = {
            let loops = self.loops.lock().expect("supervisor lock");
            loops
                .get(&project_id)
                .map(|h| !h.handle.is_finished())
                .unwrap_or(false)
        };

        let mut workers = WorkerCounts::default();
        for (_, status) in self.registry.list_classified().await.map_err(ApiError::from)? {
            workers.total += 1;
            match status {
                WorkerStatus::Idle => workers.idle += 1,
                WorkerStatus::Busy => workers.busy += 1,
                WorkerStatus::Offline => workers.offline += 1,
            }
        }

        let tasks = self
            .store
            .count_tasks_by_status(project_id)
            .await
            .map_err(ApiError::from)?;

        Ok(PmStatusResponse {
            project_id,
            running,
            workers,
            tasks,
        })
    }

    /// One-shot dispatch outside the scheduling tick. Returns the dispatched
    /// task, if any task could be dispatched.
    pub async fn queue_next(&self, project_id: ProjectId) -> ApiResult<Option<Task>> {
        let mut ready = self
            .store
            .list_tasks(project_id, Some(&[TaskStatus::Ready]))
            .await
            .map_err(ApiError::from)?;
        sort_ready(&mut ready);

        for task in &ready {
            match self.dispatcher.dispatch(task).await.map_err(ApiError::from)? {
                DispatchOutcome::Dispatched(task) => return Ok(Some(task)),
                DispatchOutcome::NoEligibleWorker => continue,
                DispatchOutcome::ProjectInactive => {
                    return Err(ApiError::state_conflict("Project is not active"))
                }
                DispatchOutcome::Skipped => continue,
            }
        }
        Ok(None)
    }

    /// One readiness sweep over `waiting` tasks.
    pub async fn promote_waiting(&self, project_id: ProjectId) -> ApiResult<Vec<Task>> {
        promote_waiting(&self.store, &self.bus, project_id)
            .await
            .map_err(ApiError::from)
    }

    /// Wake a project's loop out of its tick sleep. No-op when the loop is
    /// not running.
    pub fn wake(&self, project_id: ProjectId) {
        if let Some(handle) = self.loops.lock().expect("supervisor lock").get(&project_id) {
            handle.wake.notify_one();
        }
    }

    /// Whether a loop is currently running (test observability).
    pub fn is_running(&self, project_id: ProjectId) -> bool {
        self.loops
            .lock()
            .expect("supervisor lock")
            .get(&project_id)
            .map(|h| !h.handle.is_finished())
            .unwrap_or(false)
    }
}

// ============================================================================
// THE LOOP
// ============================================================================

#[allow(clippy::too_many_arguments)]
async fn pm_loop(
    store: Arc<dyn Store>,
    queue: Arc<dyn StreamQueue>,
    dispatcher: Arc<Dispatcher>,
    bus: Arc<BoardBus>,
    config: OrchestratorConfig,
    project_id: ProjectId,
    mut shutdown: watch::Receiver<bool>,
    wake: Arc<Notify>,
) {
    // Dependency-free waiting tasks become ready before the first pass.
    if let Err(err) = promote_waiting(&store, &bus, project_id).await {
        tracing::warn!(project_id = %project_id, error = %err, "Initial promotion failed");
    }

    let mut tick = interval(config.tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut backpressured = false;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = tick.tick() => {}
            _ = wake.notified() => {}
        }
        if *shutdown.borrow() {
            break;
        }

        match scheduling_pass(&store, &queue, &dispatcher, &config, project_id, &mut backpressured)
            .await
        {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                tracing::warn!(
                    project_id = %project_id,
                    error = %err,
                    "Scheduling pass failed; retrying on next tick"
                );
            }
        }
    }

    tracing::info!(project_id = %project_id, "PM loop exited");
}

/// One scheduling pass. Returns `Ok(false)` when the loop should exit (the
/// project is gone or no longer active).
async fn scheduling_pass(
    store: &Arc<dyn Store>,
    queue: &Arc<dyn StreamQueue>,
    dispatcher: &Arc<Dispatcher>,
    config: &OrchestratorConfig,
    project_id: ProjectId,
    backpressured: &mut bool,
) -> Result<bool, ForemanError> {
    let project = store.get_project(project_id).await?;
    match project {
        Some(p) if p.status == ProjectStatus::Active => {}
        _ => return Ok(false),
    }

    // Backpressure: stop feeding the results pipeline while it is saturated.
    let pending = queue.pending(RESULTS_STREAM, GROUP_INGESTERS).await?.len();
    if *backpressured {
        if pending >= config.backpressure_low {
            return Ok(true);
        }
        *backpressured = false;
        tracing::info!(project_id = %project_id, pending, "Backpressure released");
    } else if pending > config.backpressure_high {
        *backpressured = true;
        tracing::warn!(project_id = %project_id, pending, "Backpressure engaged");
        return Ok(true);
    }

    let mut ready = store
        .list_tasks(project_id, Some(&[TaskStatus::Ready]))
        .await?;
    if ready.is_empty() {
        return Ok(true);
    }
    sort_ready(&mut ready);

    // In-flight census for the caps.
    let in_flight = store.list_tasks(project_id, Some(&IN_FLIGHT)).await?;
    let mut project_in_flight = in_flight.len();
    let mut phase_in_flight: HashMap<PhaseId, usize> = HashMap::new();
    for task in &in_flight {
        *phase_in_flight.entry(task.phase_id).or_insert(0) += 1;
    }

    for task in &ready {
        if project_in_flight >= config.max_in_flight_project {
            break;
        }
        let phase_count = phase_in_flight.entry(task.phase_id).or_insert(0);
        if *phase_count >= config.max_in_flight_phase {
            continue;
        }

        match dispatcher.dispatch(task).await? {
            DispatchOutcome::Dispatched(_) => {
                project_in_flight += 1;
                *phase_count += 1;
            }
            DispatchOutcome::NoEligibleWorker => {
                // Left in ready; other ready tasks may need different
                // capabilities, so keep scanning.
                continue;
            }
            DispatchOutcome::ProjectInactive => return Ok(false),
            DispatchOutcome::Skipped => continue,
        }
    }

    Ok(true)
}
