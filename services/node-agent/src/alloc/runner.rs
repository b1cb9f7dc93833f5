//! The allocation runner: per-allocation supervisor.
//!
//! One runner owns one allocation from assignment to terminal state. It
//! composes a task runner per task in the group, enforces the cross-task
//! policies (leader shutdown, sibling-failure cascade), persists its state
//! across agent restarts, and reports every status change upstream and to
//! broadcast subscribers.
//!
//! Only one live runner may exist per allocation ID per process; the agent
//! is responsible for that.
//!
//! ## Lock ordering
//!
//! `state_lock` > `shared` > `task_states` > `tasks` > `alloc_dir`. Never
//! hold more than two at once.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use skiff_id::{AllocId, EvalId};
use skiff_model::{
    derive_client_status, AllocDeploymentStatus, AllocResourceUsage, Allocation, ClientStatus,
    TaskEvent, TaskEventKind, TaskResourceUsage, TaskRunState, TaskState,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::broadcast::{AllocBroadcaster, AllocListener};
use super::health::{self, HealthSetterFn, MIN_HEALTHY_TIME};
use super::prevalloc::{PrevAllocError, PrevAllocWatcher};
use super::taskrunner::{TaskRunner, TaskRunnerFactory, TaskRunnerRequest, TaskStateUpdateFn};
use crate::allocdir::{AllocDir, AllocDirError};
use crate::config::Config;
use crate::metrics::{AllocCounter, BaseLabels, ClientMetrics};
use crate::state::{
    self, AllocRecord, ImmutableRecord, MutableRecord, StateError, StateStore, ALLOC_DIR_KEY,
    ALLOC_KEY, IMMUTABLE_KEY, MUTABLE_KEY,
};

/// Capacity of the update queue. A full queue drops the update; the server
/// resends on its next reconciliation.
const UPDATE_QUEUE_DEPTH: usize = 64;

/// Broadcast retry policy.
const BROADCAST_ATTEMPTS: u32 = 3;
const BROADCAST_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Callback invoked with every freshly composed allocation snapshot.
/// Errors in the callee are its own problem; the runner never sees them.
pub type AllocUpdaterFn = Arc<dyn Fn(Allocation) + Send + Sync>;

/// Errors from restoring a runner from the state store.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("failed to read allocation state: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Dir(#[from] AllocDirError),

    #[error("restored allocation doesn't contain task group '{0}'")]
    MissingTaskGroup(String),

    #[error("failed to restore task runners: {0}")]
    TaskRestore(String),
}

/// Collaborators an allocation runner is built from.
#[derive(Clone)]
pub struct AllocRunnerDeps {
    pub config: Arc<Config>,
    pub state_store: Arc<dyn StateStore>,
    pub updater: AllocUpdaterFn,
    pub task_runner_factory: Arc<dyn TaskRunnerFactory>,
    pub prev_alloc: Arc<dyn PrevAllocWatcher>,
    pub metrics: Arc<ClientMetrics>,
}

/// State guarded by the allocation lock.
struct AllocShared {
    alloc: Allocation,

    /// Explicit status, set on failures. Overrides the derived status.
    client_status: Option<ClientStatus>,
    client_description: String,

    /// Health decision from the health watcher.
    health: Option<bool>,
    health_time: Option<DateTime<Utc>>,
}

/// State guarded by the task lock.
#[derive(Default)]
struct TaskSet {
    runners: BTreeMap<String, Arc<dyn TaskRunner>>,

    /// Tasks restored from the state store; `run` does not start these.
    restored: BTreeSet<String>,
}

/// Supervisor of one allocation.
pub struct AllocRunner {
    /// Immutable for the runner's lifetime, safe to read without a lock.
    alloc_id: AllocId,

    config: Arc<Config>,
    state_store: Arc<dyn StateStore>,
    updater: AllocUpdaterFn,
    factory: Arc<dyn TaskRunnerFactory>,
    prev_alloc: Arc<dyn PrevAllocWatcher>,
    metrics: Arc<ClientMetrics>,

    shared: Mutex<AllocShared>,
    alloc_dir: Mutex<AllocDir>,
    tasks: RwLock<TaskSet>,
    task_states: RwLock<BTreeMap<String, TaskState>>,

    /// Serializes persistence against destruction.
    state_lock: Mutex<()>,

    /// Last persisted evaluation ID. The alloc record is rewritten only
    /// when the evaluation changes.
    persisted_eval: Arc<Mutex<Option<EvalId>>>,

    /// One-shot write flags, flipped only in commit callbacks.
    immutable_persisted: Arc<AtomicBool>,
    alloc_dir_persisted: Arc<AtomicBool>,

    dirty_tx: mpsc::Sender<()>,
    dirty_rx: Mutex<Option<mpsc::Receiver<()>>>,
    update_tx: mpsc::Sender<Allocation>,
    update_rx: Mutex<Option<mpsc::Receiver<Allocation>>>,

    broadcast: AllocBroadcaster,

    /// Canceled by `destroy` to tear the whole supervision tree down.
    cancel: CancellationToken,

    /// Flipped when `run` returns; the allocation has stopped and its
    /// state has been cleaned up.
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,

    base_labels: OnceLock<BaseLabels>,
}

impl AllocRunner {
    /// Create a runner for an allocation. Supervision starts with [`run`].
    ///
    /// [`run`]: AllocRunner::run
    pub fn new(deps: AllocRunnerDeps, alloc: Allocation) -> Arc<Self> {
        let (dirty_tx, dirty_rx) = mpsc::channel(1);
        let (update_tx, update_rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);
        let (done_tx, done_rx) = watch::channel(false);

        let alloc_dir = AllocDir::new(&deps.config.alloc_root, &alloc.id);
        let task_states = alloc.task_states.clone();

        Arc::new(Self {
            alloc_id: alloc.id,
            config: deps.config,
            state_store: deps.state_store,
            updater: deps.updater,
            factory: deps.task_runner_factory,
            prev_alloc: deps.prev_alloc,
            metrics: deps.metrics,
            shared: Mutex::new(AllocShared {
                alloc,
                client_status: None,
                client_description: String::new(),
                health: None,
                health_time: None,
            }),
            alloc_dir: Mutex::new(alloc_dir),
            tasks: RwLock::new(TaskSet::default()),
            task_states: RwLock::new(task_states),
            state_lock: Mutex::new(()),
            persisted_eval: Arc::new(Mutex::new(None)),
            immutable_persisted: Arc::new(AtomicBool::new(false)),
            alloc_dir_persisted: Arc::new(AtomicBool::new(false)),
            dirty_tx,
            dirty_rx: Mutex::new(Some(dirty_rx)),
            update_tx,
            update_rx: Mutex::new(Some(update_rx)),
            broadcast: AllocBroadcaster::new(),
            cancel: CancellationToken::new(),
            done_tx,
            done_rx,
            base_labels: OnceLock::new(),
        })
    }

    /// The allocation ID this runner supervises.
    pub fn alloc_id(&self) -> AllocId {
        self.alloc_id
    }

    /// Subscribe to snapshot broadcasts.
    pub fn listener(&self) -> AllocListener {
        self.broadcast.listen()
    }

    /// Whether this runner is waiting on a previous allocation.
    pub fn is_waiting(&self) -> bool {
        self.prev_alloc.is_waiting()
    }

    /// Whether this runner is migrating data from a previous allocation.
    pub fn is_migrating(&self) -> bool {
        self.prev_alloc.is_migrating()
    }

    /// Queue an updated allocation from the server. Never blocks; a full
    /// queue drops the update with an error log.
    pub fn update(&self, alloc: Allocation) {
        match self.update_tx.try_send(alloc) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                error!(
                    alloc_id = %self.alloc_id,
                    "Dropping allocation update, update queue is full"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(alloc_id = %self.alloc_id, "Dropping update to stopped runner");
            }
        }
    }

    /// Whether the server's view of the allocation is newer than ours.
    pub fn should_update(&self, server_index: u64) -> bool {
        let shared = self.shared.lock().unwrap();
        shared.alloc.alloc_modify_index < server_index
    }

    /// Request destruction: stop all tasks, clean up state and directory.
    /// `wait` resolves once everything is done.
    pub fn destroy(&self) {
        // Holding the state lock serializes against an in-flight persist.
        let _guard = self.state_lock.lock().unwrap();
        self.cancel.cancel();
        self.broadcast.close();
    }

    /// Whether the runner has stopped and been cleaned up.
    pub fn is_destroyed(&self) -> bool {
        *self.done_rx.borrow()
    }

    /// Resolve once `run` has returned.
    pub async fn wait(&self) {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    /// Record a health decision. Called by the health watcher.
    pub fn set_health(&self, healthy: bool) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.health = Some(healthy);
            shared.health_time = Some(Utc::now());
        }
        self.mark_dirty();
    }

    // -------------------------------------------------------------------------
    // Snapshot composition
    // -------------------------------------------------------------------------

    /// Compose a fresh snapshot of the allocation. The job subtree is
    /// shared by reference, everything else is copied.
    pub fn alloc(&self) -> Allocation {
        let mut alloc;
        {
            let shared = self.shared.lock().unwrap();
            alloc = shared.alloc.clone();

            // An explicitly set status wins over everything derived.
            if shared.client_status.is_some() || !shared.client_description.is_empty() {
                if let Some(status) = shared.client_status {
                    alloc.client_status = status;
                }
                alloc.client_description = shared.client_description.clone();
                alloc.task_states = self.task_states.read().unwrap().clone();
                drop(shared);
                self.finalize_terminal_alloc(&mut alloc);
                return alloc;
            }

            if let Some(healthy) = shared.health {
                let status = alloc.deployment_status.get_or_insert_with(Default::default);
                status.healthy = Some(healthy);
                status.timestamp = shared.health_time;
            }
        }

        {
            let task_states = self.task_states.read().unwrap();
            alloc.task_states = task_states.clone();
            if let Some(status) = derive_client_status(&task_states) {
                alloc.client_status = status;
            }
        }

        // A failed allocation in a deployment is unhealthy even if the
        // health watcher never got to decide.
        if alloc.client_status == ClientStatus::Failed
            && alloc.deployment_id.is_some()
            && !alloc
                .deployment_status
                .as_ref()
                .is_some_and(AllocDeploymentStatus::is_unhealthy)
        {
            alloc.deployment_status = Some(AllocDeploymentStatus {
                healthy: Some(false),
                timestamp: None,
            });
        }

        self.finalize_terminal_alloc(&mut alloc);
        alloc
    }

    /// Ensure a terminal allocation has a task state with a finish time for
    /// every task in the group, so the server can compute reschedule times.
    fn finalize_terminal_alloc(&self, alloc: &mut Allocation) {
        if !alloc.terminated() {
            return;
        }
        let Some(group) = alloc.job.task_group(&alloc.task_group) else {
            return;
        };

        let mut task_states = self.task_states.write().unwrap();
        let now = Utc::now();
        for task in &group.tasks {
            let state = task_states.entry(task.name.clone()).or_default();
            if state.finished_at.is_none() {
                state.finished_at = Some(now);
            }
        }
        alloc.task_states = task_states.clone();
    }

    // -------------------------------------------------------------------------
    // Status updates from tasks
    // -------------------------------------------------------------------------

    fn set_status(&self, status: ClientStatus, description: impl Into<String>) {
        {
            let mut shared = self.shared.lock().unwrap();
            shared.client_status = Some(status);
            shared.client_description = description.into();
        }
        self.mark_dirty();
    }

    /// Record a task state change reported by a task runner.
    ///
    /// `state` of `None` keeps the last known state. Lazy changes append
    /// the event without triggering a sync. A task entering `Dead` runs the
    /// cross-task policies: a failed task destroys every sibling, a dead
    /// leader destroys every follower.
    fn set_task_state(
        &self,
        task_name: &str,
        state: Option<TaskRunState>,
        event: Option<TaskEvent>,
        lazy: bool,
    ) {
        let labels = self.base_labels.get().cloned().unwrap_or_default();
        {
            let mut task_states = self.task_states.write().unwrap();
            let task_state = task_states.entry(task_name.to_string()).or_default();

            if let Some(event) = event {
                if event.fails_task {
                    task_state.failed = true;
                }
                if event.kind == TaskEventKind::Restarting {
                    self.metrics
                        .incr_alloc(AllocCounter::Restart, &labels, Some(task_name));
                    task_state.restarts += 1;
                    task_state.last_restart = Some(event.time);
                }
                task_state.append_event(event);
            }

            if lazy {
                return;
            }

            let state = state.unwrap_or(task_state.state);

            // Dead is terminal.
            if task_state.state == TaskRunState::Dead && state != TaskRunState::Dead {
                return;
            }

            match state {
                TaskRunState::Pending => {}
                TaskRunState::Running => {
                    if task_state.state != TaskRunState::Running {
                        task_state.started_at = Some(Utc::now());
                        self.metrics
                            .incr_alloc(AllocCounter::Running, &labels, Some(task_name));
                    }
                }
                TaskRunState::Dead => {
                    if task_state.finished_at.is_none() {
                        task_state.finished_at = Some(Utc::now());
                    }
                    let failed = task_state.failed;

                    let (other_runners, dead_was_leader) = {
                        let tasks = self.tasks.read().unwrap();
                        let mut others: Vec<Arc<dyn TaskRunner>> = Vec::new();
                        let mut leader = false;
                        for (name, runner) in &tasks.runners {
                            if name != task_name {
                                others.push(runner.clone());
                            } else if runner.is_leader() {
                                leader = true;
                            }
                        }
                        (others, leader)
                    };

                    self.metrics.incr_alloc(
                        if failed {
                            AllocCounter::Failed
                        } else {
                            AllocCounter::Complete
                        },
                        &labels,
                        Some(task_name),
                    );

                    if failed {
                        for runner in &other_runners {
                            runner.destroy(
                                TaskEvent::new(TaskEventKind::SiblingFailed)
                                    .with_failed_sibling(task_name),
                            );
                        }
                        if !other_runners.is_empty() {
                            debug!(
                                alloc_id = %self.alloc_id,
                                task = %task_name,
                                "Task failed, destroying other tasks in task group"
                            );
                        }
                    } else if dead_was_leader {
                        for runner in &other_runners {
                            runner.destroy(TaskEvent::new(TaskEventKind::LeaderDead));
                        }
                        if !other_runners.is_empty() {
                            debug!(
                                alloc_id = %self.alloc_id,
                                task = %task_name,
                                "Leader task is dead, destroying other tasks in task group"
                            );
                        }
                    }
                }
            }

            task_state.state = state;
        }
        self.mark_dirty();
    }

    /// The back-edge handed to task runners. A weak reference keeps the
    /// ownership one-directional.
    fn state_update_fn(self: &Arc<Self>) -> TaskStateUpdateFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |task_name, state, event, lazy| {
            if let Some(runner) = weak.upgrade() {
                runner.set_task_state(task_name, state, event, lazy);
            }
        })
    }

    fn health_setter(self: &Arc<Self>) -> HealthSetterFn {
        let weak = Arc::downgrade(self);
        Arc::new(move |healthy| {
            if let Some(runner) = weak.upgrade() {
                runner.set_health(healthy);
            }
        })
    }

    fn mark_dirty(&self) {
        // Capacity-1 channel: overflow coalesces into the pending signal.
        let _ = self.dirty_tx.try_send(());
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Persist runner state and every task runner's state.
    pub fn save_state(&self) -> anyhow::Result<()> {
        self.save_alloc_runner_state()
            .context("failed to save allocation runner state")?;

        let mut errors = Vec::new();
        for runner in self.task_runners() {
            if let Err(e) = runner.save_state() {
                errors.push(format!("task '{}': {}", runner.name(), e));
            }
        }
        if !errors.is_empty() {
            bail!("failed to save task runner state: {}", errors.join("; "));
        }
        Ok(())
    }

    /// Persist the four state records inside one transaction, honoring the
    /// per-record write discipline.
    fn save_alloc_runner_state(&self) -> Result<(), StateError> {
        let _guard = self.state_lock.lock().unwrap();

        // Destroyed runners have nothing left worth persisting.
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let alloc = self.alloc();
        let (client_status, client_description) = {
            let shared = self.shared.lock().unwrap();
            (shared.client_status, shared.client_description.clone())
        };
        let alloc_dir_snapshot = self.alloc_dir.lock().unwrap().clone();

        self.state_store.update(&self.alloc_id, &mut |bucket| {
            // The alloc record changes only when the evaluation does.
            let last_persisted = *self.persisted_eval.lock().unwrap();
            if last_persisted != Some(alloc.eval_id) {
                state::put_object(
                    bucket,
                    ALLOC_KEY,
                    &AllocRecord {
                        alloc: alloc.clone(),
                    },
                )?;
                let slot = self.persisted_eval.clone();
                let eval_id = alloc.eval_id;
                bucket.on_commit(Box::new(move || {
                    *slot.lock().unwrap() = Some(eval_id);
                }));
            }

            if !self.immutable_persisted.load(Ordering::SeqCst) {
                state::put_object(
                    bucket,
                    IMMUTABLE_KEY,
                    &ImmutableRecord {
                        agent_version: self.config.version.clone(),
                    },
                )?;
                let flag = self.immutable_persisted.clone();
                bucket.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));
            }

            if !self.alloc_dir_persisted.load(Ordering::SeqCst) {
                state::put_object(bucket, ALLOC_DIR_KEY, &alloc_dir_snapshot)?;
                let flag = self.alloc_dir_persisted.clone();
                bucket.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));
            }

            state::put_object(
                bucket,
                MUTABLE_KEY,
                &MutableRecord {
                    client_status,
                    client_description: client_description.clone(),
                    task_states: alloc.task_states.clone(),
                    deployment_status: alloc.deployment_status.clone(),
                },
            )?;

            Ok(())
        })
    }

    /// Delete the allocation's state bucket.
    pub fn destroy_state(&self) -> Result<(), StateError> {
        let _guard = self.state_lock.lock().unwrap();
        self.state_store.delete_bucket(&self.alloc_id)
    }

    /// Remove the allocation directory from disk.
    pub fn destroy_context(&self) -> Result<(), AllocDirError> {
        self.alloc_dir.lock().unwrap().destroy()
    }

    /// Restore runner state persisted by an earlier process. Must be called
    /// before [`run`]; task runners for live tasks are restored and
    /// relaunched here.
    ///
    /// [`run`]: AllocRunner::run
    pub fn restore_state(self: &Arc<Self>) -> Result<(), RestoreError> {
        let mut alloc_record: Option<AllocRecord> = None;
        let mut immutable: Option<ImmutableRecord> = None;
        let mut mutable: Option<MutableRecord> = None;
        let mut dir_record: Option<AllocDir> = None;

        self.state_store.view(&self.alloc_id, &mut |bucket| {
            alloc_record = state::get_object(bucket, ALLOC_KEY)?;
            immutable = state::get_object(bucket, IMMUTABLE_KEY)?;
            mutable = state::get_object(bucket, MUTABLE_KEY)?;
            dir_record = state::get_object(bucket, ALLOC_DIR_KEY)?;
            Ok(())
        })?;

        let missing = |key| StateError::MissingRecord {
            alloc_id: self.alloc_id,
            key,
        };
        let alloc_record = alloc_record.ok_or_else(|| missing(ALLOC_KEY))?;
        let _ = immutable.ok_or_else(|| missing(IMMUTABLE_KEY))?;
        let mutable = mutable.ok_or_else(|| missing(MUTABLE_KEY))?;
        let dir_record = dir_record.ok_or_else(|| missing(ALLOC_DIR_KEY))?;

        // Terminal per the persisted server view. The derived status below
        // may already be failed (a dead failed task dominates), but live
        // sibling tasks must still be restored in that case.
        let server_terminal = alloc_record.alloc.terminal_status();

        let alloc = {
            let mut shared = self.shared.lock().unwrap();
            shared.alloc = alloc_record.alloc;
            shared.client_status = mutable.client_status;
            shared.client_description = mutable.client_description;
            shared.alloc.deployment_status = mutable.deployment_status;
            if let Some(status) = derive_client_status(&mutable.task_states) {
                shared.alloc.client_status = status;
            }
            shared.alloc.clone()
        };
        *self.task_states.write().unwrap() = mutable.task_states.clone();
        *self.alloc_dir.lock().unwrap() = dir_record;

        let group = alloc
            .job
            .task_group(&alloc.task_group)
            .ok_or_else(|| RestoreError::MissingTaskGroup(alloc.task_group.clone()))?;

        let update_fn = self.state_update_fn();
        let mut errors = Vec::new();
        for task in &group.tasks {
            // Agent exited before the task could start; run() will start it
            // fresh.
            let Some(task_state) = mutable.task_states.get(&task.name) else {
                continue;
            };

            self.tasks
                .write()
                .unwrap()
                .restored
                .insert(task.name.clone());

            // Task dirs are created during run(), so the agent may have
            // persisted state before all of them existed.
            let task_dir = self.alloc_dir.lock().unwrap().new_task_dir(&task.name)?;

            // Dead tasks stay dead; nothing to supervise. The same goes for
            // every task of an allocation the server already stopped.
            if task_state.state == TaskRunState::Dead || server_terminal {
                continue;
            }

            let runner = self.factory.create(TaskRunnerRequest {
                alloc_id: self.alloc_id,
                task: task.clone(),
                task_dir,
                alloc: self.alloc(),
                on_state_change: update_fn.clone(),
            });
            self.tasks
                .write()
                .unwrap()
                .runners
                .insert(task.name.clone(), runner.clone());

            match runner.restore_state() {
                Err(e) => {
                    error!(
                        alloc_id = %self.alloc_id,
                        task = %task.name,
                        error = %e,
                        "Failed to restore task runner state"
                    );
                    errors.push(format!("task '{}': {}", task.name, e));
                }
                Ok(restart_reason) => {
                    tokio::spawn(runner.clone().run());
                    if !restart_reason.is_empty() {
                        info!(
                            alloc_id = %self.alloc_id,
                            task = %task.name,
                            reason = %restart_reason,
                            "Restarting task after restore"
                        );
                        runner.restart("upgrade", &restart_reason, false);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(RestoreError::TaskRestore(errors.join("; ")));
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Sync
    // -------------------------------------------------------------------------

    /// Compose a snapshot, push it upstream, broadcast it, persist it.
    async fn sync_status(&self) -> Result<(), StateError> {
        let alloc = self.alloc();
        (self.updater)(alloc.clone());
        self.send_broadcast(alloc).await;
        self.save_alloc_runner_state()
    }

    async fn send_broadcast(&self, alloc: Allocation) {
        for attempt in 0..BROADCAST_ATTEMPTS {
            if self.broadcast.send(alloc.clone()) {
                return;
            }
            if attempt + 1 < BROADCAST_ATTEMPTS {
                tokio::time::sleep(BROADCAST_RETRY_DELAY).await;
            }
        }
        warn!(alloc_id = %self.alloc_id, "Failed to broadcast allocation update");
    }

    /// Drain dirty signals until the runner is destroyed.
    async fn dirty_sync_loop(self: Arc<Self>, mut dirty_rx: mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,

                signal = dirty_rx.recv() => match signal {
                    Some(()) => {
                        if let Err(e) = self.sync_status().await {
                            // Not fatal: the next dirty signal retries.
                            warn!(
                                alloc_id = %self.alloc_id,
                                error = %e,
                                "Error persisting allocation state"
                            );
                        }
                    }
                    None => return,
                },
            }
        }
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    fn base_labels(&self) -> BaseLabels {
        self.base_labels.get().cloned().unwrap_or_default()
    }

    fn set_base_labels(&self) {
        let labels = {
            let shared = self.shared.lock().unwrap();
            BaseLabels {
                job: shared.alloc.job.name.clone(),
                task_group: shared.alloc.task_group.clone(),
                node_id: self.config.node_id.to_string(),
            }
        };
        let _ = self.base_labels.set(labels);
    }

    fn spawn_health_watcher(self: &Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(health::watch_health(
            cancel,
            self.broadcast.listen(),
            self.alloc(),
            MIN_HEALTHY_TIME,
            self.health_setter(),
        ));
    }

    /// Supervise the allocation until it reaches a terminal state and is
    /// destroyed. Spawn this once per runner.
    pub async fn run(self: Arc<Self>) {
        let (update_rx, dirty_rx) = {
            let update_rx = self.update_rx.lock().unwrap().take();
            let dirty_rx = self.dirty_rx.lock().unwrap().take();
            (update_rx, dirty_rx)
        };
        let (Some(mut update_rx), Some(dirty_rx)) = (update_rx, dirty_rx) else {
            error!(alloc_id = %self.alloc_id, "Allocation runner started more than once");
            return;
        };

        self.set_base_labels();
        tokio::spawn(self.clone().dirty_sync_loop(dirty_rx));

        self.run_inner(&mut update_rx).await;

        let _ = self.done_tx.send(true);
        debug!(alloc_id = %self.alloc_id, "Terminating allocation runner");
    }

    async fn run_inner(self: &Arc<Self>, update_rx: &mut mpsc::Receiver<Allocation>) {
        let alloc = self.alloc();
        let Some(group) = alloc.job.task_group(&alloc.task_group).cloned() else {
            error!(
                alloc_id = %self.alloc_id,
                task_group = %alloc.task_group,
                "Allocation references a missing task group"
            );
            self.set_status(
                ClientStatus::Failed,
                format!("missing task group '{}'", alloc.task_group),
            );
            return;
        };

        // Build the allocation directory (idempotent).
        if let Err(e) = self.alloc_dir.lock().unwrap().build() {
            error!(alloc_id = %self.alloc_id, error = %e, "Failed to build task directories");
            self.set_status(
                ClientStatus::Failed,
                format!("failed to build task dirs for '{}'", alloc.task_group),
            );
            return;
        }

        // Wait for a previous allocation, if any, to terminate.
        match self.prev_alloc.wait(&self.cancel).await {
            Ok(()) => {}
            Err(PrevAllocError::Canceled) => return,
            Err(e) => {
                self.set_status(
                    ClientStatus::Failed,
                    format!("error while waiting for previous alloc to terminate: {e}"),
                );
                return;
            }
        }

        // Migrate sticky data from the previous allocation. Migration
        // failures are soft: rebuild the directory and carry on.
        let migrate_result = {
            let dir = self.alloc_dir.lock().unwrap();
            self.prev_alloc.migrate(&self.cancel, &dir)
        };
        match migrate_result {
            Ok(()) => {}
            Err(PrevAllocError::Canceled) => return,
            Err(e) => {
                warn!(
                    alloc_id = %self.alloc_id,
                    error = %e,
                    "Error while migrating data from previous alloc"
                );
                let rebuilt = {
                    let mut dir = self.alloc_dir.lock().unwrap();
                    dir.destroy().and_then(|()| dir.build())
                };
                if let Err(e) = rebuilt {
                    error!(
                        alloc_id = %self.alloc_id,
                        error = %e,
                        "Failed to clean task directories after failed migration"
                    );
                    self.set_status(
                        ClientStatus::Failed,
                        format!("failed to rebuild task dirs for '{}'", alloc.task_group),
                    );
                    return;
                }
            }
        }

        // A terminal allocation starts no tasks; wait for the destroy
        // signal and clean up.
        if alloc.terminal_status() {
            debug!(alloc_id = %self.alloc_id, "Allocation in terminal status, waiting for destroy");
            if !alloc.terminated() {
                self.set_status(
                    ClientStatus::Complete,
                    "canceled running tasks for allocation in terminal state",
                );
            }
            // Restore may have relaunched runners for tasks that were
            // still live; they must not outlive the allocation.
            if !self.task_runners().is_empty() {
                self.destroy_task_runners(TaskEvent::new(TaskEventKind::Killed))
                    .await;
            }
            self.handle_destroy(update_rx).await;
            return;
        }

        // Incremented even when restoring existing tasks, so one start is
        // not one task execution.
        self.metrics
            .incr_alloc(AllocCounter::Start, &self.base_labels(), None);

        let mut watcher_cancel = self.cancel.child_token();
        self.spawn_health_watcher(watcher_cancel.clone());

        // Start a task runner for every task not restored from state.
        debug!(alloc_id = %self.alloc_id, "Starting task runners");
        let update_fn = self.state_update_fn();
        let restored = self.tasks.read().unwrap().restored.clone();
        let mut created: Vec<Arc<dyn TaskRunner>> = Vec::new();
        for task in &group.tasks {
            if restored.contains(&task.name) {
                continue;
            }

            let task_dir = match self.alloc_dir.lock().unwrap().new_task_dir(&task.name) {
                Ok(dir) => dir,
                Err(e) => {
                    error!(
                        alloc_id = %self.alloc_id,
                        task = %task.name,
                        error = %e,
                        "Failed to build task directory"
                    );
                    self.set_status(
                        ClientStatus::Failed,
                        format!("failed to build task dirs for '{}'", alloc.task_group),
                    );
                    return;
                }
            };

            let runner = self.factory.create(TaskRunnerRequest {
                alloc_id: self.alloc_id,
                task: task.clone(),
                task_dir,
                alloc: self.alloc(),
                on_state_change: update_fn.clone(),
            });
            self.tasks
                .write()
                .unwrap()
                .runners
                .insert(task.name.clone(), runner.clone());
            created.push(runner);
        }
        for runner in created {
            runner.mark_received();
            tokio::spawn(runner.run());
        }

        // Service updates until the allocation turns terminal or the owner
        // destroys us.
        let destroy_event = loop {
            tokio::select! {
                update = update_rx.recv() => {
                    let Some(update) = update else {
                        break TaskEvent::new(TaskEventKind::Killed);
                    };

                    {
                        let mut shared = self.shared.lock().unwrap();
                        // A new deployment restarts health observation from
                        // scratch.
                        if shared.alloc.deployment_id != update.deployment_id {
                            shared.health = None;
                            shared.health_time = None;
                        }
                        shared.alloc = update.clone();
                    }

                    watcher_cancel.cancel();
                    watcher_cancel = self.cancel.child_token();
                    self.spawn_health_watcher(watcher_cancel.clone());

                    if update.terminal_status() {
                        break TaskEvent::new(TaskEventKind::Killed);
                    }

                    for runner in self.task_runners() {
                        runner.update(update.clone());
                    }

                    if let Err(e) = self.sync_status().await {
                        warn!(
                            alloc_id = %self.alloc_id,
                            error = %e,
                            "Failed to sync allocation status after update"
                        );
                    }
                }

                _ = self.cancel.cancelled() => {
                    break TaskEvent::new(TaskEventKind::Killed);
                }
            }
        };

        self.destroy_task_runners(destroy_event).await;
        self.handle_destroy(update_rx).await;
        watcher_cancel.cancel();
    }

    /// Destroy every task runner: the leader first, waiting for it to
    /// drain, then the rest concurrently.
    async fn destroy_task_runners(&self, destroy_event: TaskEvent) {
        let leader = {
            let shared = self.shared.lock().unwrap();
            shared
                .alloc
                .lookup_task_group()
                .and_then(|tg| tg.leader())
                .map(|task| task.name.clone())
        };

        if let Some(leader_name) = &leader {
            let runner = self.tasks.read().unwrap().runners.get(leader_name).cloned();
            match runner {
                // Dead tasks have no runner, so the leader may already be
                // gone.
                None => debug!(
                    alloc_id = %self.alloc_id,
                    task = %leader_name,
                    "Leader task already stopped"
                ),
                Some(runner) => {
                    debug!(
                        alloc_id = %self.alloc_id,
                        task = %leader_name,
                        "Destroying leader task first"
                    );
                    runner.destroy(destroy_event.clone());
                    runner.wait().await;
                }
            }
        }

        let followers: Vec<Arc<dyn TaskRunner>> = {
            let tasks = self.tasks.read().unwrap();
            tasks
                .runners
                .iter()
                .filter(|(name, _)| leader.as_deref() != Some(name.as_str()))
                .map(|(_, runner)| runner.clone())
                .collect()
        };
        for runner in &followers {
            runner.destroy(destroy_event.clone());
        }

        for runner in self.task_runners() {
            runner.wait().await;
        }
    }

    /// Final sync, then block until the owner destroys the allocation and
    /// clean up its directory and state bucket.
    async fn handle_destroy(&self, update_rx: &mut mpsc::Receiver<Allocation>) {
        let alloc = self.alloc();

        self.metrics
            .incr_alloc(AllocCounter::Destroy, &self.base_labels(), None);

        self.send_broadcast(alloc.clone()).await;
        if let Err(e) = self.save_alloc_runner_state() {
            warn!(
                alloc_id = %self.alloc_id,
                error = %e,
                "Unable to persist state, but the allocation will be GC'd soon anyway"
            );
        }

        // No tasks are running anymore; unmounting here keeps the data dir
        // removable.
        if let Err(e) = self.alloc_dir.lock().unwrap().unmount_all() {
            error!(alloc_id = %self.alloc_id, error = %e, "Unable to unmount task directories");
        }

        // From here on the server sees the terminal status and may GC the
        // allocation at any time.
        (self.updater)(alloc);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.cleanup();
                    return;
                }

                update = update_rx.recv() => {
                    if update.is_some() {
                        debug!(alloc_id = %self.alloc_id, "Dropping update to terminal allocation");
                    } else {
                        self.cancel.cancelled().await;
                        self.cleanup();
                        return;
                    }
                }
            }
        }
    }

    fn cleanup(&self) {
        if let Err(e) = self.destroy_context() {
            error!(
                alloc_id = %self.alloc_id,
                error = %e,
                "Failed to destroy allocation directory"
            );
        }
        if let Err(e) = self.destroy_state() {
            error!(
                alloc_id = %self.alloc_id,
                error = %e,
                "Failed to destroy allocation state"
            );
        }
    }

    // -------------------------------------------------------------------------
    // Stats
    // -------------------------------------------------------------------------

    /// Aggregate the latest resource usage across task runners. With a
    /// filter, only that task is included.
    pub fn latest_alloc_stats(
        &self,
        task_filter: Option<&str>,
    ) -> anyhow::Result<AllocResourceUsage> {
        let mut tasks: BTreeMap<String, TaskResourceUsage> = BTreeMap::new();

        match task_filter {
            Some(name) => {
                let runner = self
                    .tasks
                    .read()
                    .unwrap()
                    .runners
                    .get(name)
                    .cloned()
                    .with_context(|| {
                        format!("allocation {} has no task '{}'", self.alloc_id, name)
                    })?;
                if let Some(usage) = runner.latest_resource_usage() {
                    tasks.insert(name.to_string(), usage);
                }
            }
            None => {
                for runner in self.task_runners() {
                    if let Some(usage) = runner.latest_resource_usage() {
                        tasks.insert(runner.name().to_string(), usage);
                    }
                }
            }
        }

        Ok(AllocResourceUsage::from_tasks(tasks))
    }

    fn task_runners(&self) -> Vec<Arc<dyn TaskRunner>> {
        self.tasks.read().unwrap().runners.values().cloned().collect()
    }
}
