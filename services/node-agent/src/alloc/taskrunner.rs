//! Task runner contract and mock implementation.
//!
//! The allocation runner supervises one task runner per task in its group.
//! Task runners own process execution; the allocation runner only consumes
//! this interface. State changes flow back through the callback handed to
//! the factory at creation time.
//!
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use skiff_id::AllocId;
use skiff_model::{
    Allocation, Task, TaskEvent, TaskEventKind, TaskResourceUsage, TaskRunState,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use crate::allocdir::TaskDir;

/// Callback for reporting a task's state change to its allocation runner.
///
/// Arguments: task name, new state (`None` keeps the last known state), an
/// optional event for the task's history, and whether the change is lazy
/// (recorded without triggering a sync).
pub type TaskStateUpdateFn =
    Arc<dyn Fn(&str, Option<TaskRunState>, Option<TaskEvent>, bool) + Send + Sync>;

/// Everything a factory needs to build one task runner.
pub struct TaskRunnerRequest {
    /// Allocation the task belongs to.
    pub alloc_id: AllocId,

    /// The task definition.
    pub task: Task,

    /// The task's directory on disk.
    pub task_dir: TaskDir,

    /// Snapshot of the allocation at creation time.
    pub alloc: Allocation,

    /// Back-edge for state changes.
    pub on_state_change: TaskStateUpdateFn,
}

/// Supervisor of a single task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Task name.
    fn name(&self) -> &str;

    /// Whether this task is the group leader.
    fn is_leader(&self) -> bool;

    /// Supervise the task until it stops. Spawned by the allocation runner.
    async fn run(self: Arc<Self>);

    /// Record that the server's assignment of this task was received.
    fn mark_received(&self);

    /// Apply an updated allocation.
    fn update(&self, alloc: Allocation);

    /// Restart the task. `fail` marks the restart as a failure.
    fn restart(&self, reason: &str, description: &str, fail: bool);

    /// Kill the task, recording `event` as the cause. Asynchronous: the
    /// runner observes completion through `wait`.
    fn destroy(&self, event: TaskEvent);

    /// Resolve once the task runner has fully stopped.
    async fn wait(&self);

    /// Persist the task runner's own state.
    fn save_state(&self) -> Result<()>;

    /// Restore state persisted by an earlier process. Returns a non-empty
    /// reason if the task should be restarted after restore.
    fn restore_state(&self) -> Result<String>;

    /// Most recent resource measurement, if any.
    fn latest_resource_usage(&self) -> Option<TaskResourceUsage>;
}

/// Builds task runners for an allocation runner.
pub trait TaskRunnerFactory: Send + Sync {
    fn create(&self, request: TaskRunnerRequest) -> Arc<dyn TaskRunner>;
}

// =============================================================================
// Mock Task Runner
// =============================================================================

/// A recorded `restart` call.
#[derive(Debug, Clone)]
pub struct RestartCall {
    pub reason: String,
    pub description: String,
    pub fail: bool,
}

enum StopSignal {
    Destroyed(TaskEvent),
    Finished { failed: bool },
}

/// Mock task runner for testing and development.
///
/// Tests drive lifecycle transitions through [`MockTaskRunner::start_running`]
/// and [`MockTaskRunner::finish`], and observe what the allocation runner did
/// through the recorded calls.
pub struct MockTaskRunner {
    name: String,
    leader: bool,
    on_state_change: TaskStateUpdateFn,
    restore_reason: String,

    received: AtomicBool,
    destroy_events: Mutex<Vec<TaskEvent>>,
    restarts: Mutex<Vec<RestartCall>>,
    updates: Mutex<Vec<Allocation>>,
    usage: Mutex<Option<TaskResourceUsage>>,

    stop_tx: mpsc::UnboundedSender<StopSignal>,
    stop_rx: Mutex<Option<mpsc::UnboundedReceiver<StopSignal>>>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,

    /// Shared call-ordering log, when the factory provides one.
    log: Option<Arc<Mutex<Vec<String>>>>,
}

impl MockTaskRunner {
    fn new(
        request: &TaskRunnerRequest,
        restore_reason: String,
        log: Option<Arc<Mutex<Vec<String>>>>,
    ) -> Self {
        let (stop_tx, stop_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            name: request.task.name.clone(),
            leader: request.task.leader,
            on_state_change: request.on_state_change.clone(),
            restore_reason,
            received: AtomicBool::new(false),
            destroy_events: Mutex::new(Vec::new()),
            restarts: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            usage: Mutex::new(None),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
            done_tx,
            done_rx,
            log,
        }
    }

    fn log(&self, entry: String) {
        if let Some(log) = &self.log {
            log.lock().unwrap().push(entry);
        }
    }

    /// Report the task as running.
    pub fn start_running(&self) {
        (self.on_state_change)(
            &self.name,
            Some(TaskRunState::Running),
            Some(TaskEvent::new(TaskEventKind::Started)),
            false,
        );
    }

    /// Let the task exit on its own, successfully or not.
    pub fn finish(&self, failed: bool) {
        let _ = self.stop_tx.send(StopSignal::Finished { failed });
    }

    /// Report a restart of the task.
    pub fn report_restart(&self, reason: &str) {
        (self.on_state_change)(
            &self.name,
            Some(TaskRunState::Running),
            Some(TaskEvent::new(TaskEventKind::Restarting).with_restart_reason(reason)),
            false,
        );
    }

    /// Set the measurement returned by `latest_resource_usage`.
    pub fn set_resource_usage(&self, usage: TaskResourceUsage) {
        *self.usage.lock().unwrap() = Some(usage);
    }

    /// Destroy events recorded so far.
    pub fn destroy_events(&self) -> Vec<TaskEvent> {
        self.destroy_events.lock().unwrap().clone()
    }

    /// Restart calls recorded so far.
    pub fn restarts(&self) -> Vec<RestartCall> {
        self.restarts.lock().unwrap().clone()
    }

    /// Allocation updates received so far.
    pub fn updates(&self) -> Vec<Allocation> {
        self.updates.lock().unwrap().clone()
    }

    /// Whether `mark_received` was called.
    pub fn was_received(&self) -> bool {
        self.received.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskRunner for MockTaskRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_leader(&self) -> bool {
        self.leader
    }

    async fn run(self: Arc<Self>) {
        let Some(mut stop_rx) = self.stop_rx.lock().unwrap().take() else {
            return;
        };

        debug!(task = %self.name, "[MOCK] Task runner started");

        // A real runner supervises the process here; the mock just waits to
        // be told how the task ends.
        let event = match stop_rx.recv().await {
            Some(StopSignal::Destroyed(event)) => event,
            Some(StopSignal::Finished { failed }) => {
                let event = TaskEvent::new(TaskEventKind::Terminated);
                if failed {
                    event.fails_task()
                } else {
                    event
                }
            }
            None => TaskEvent::new(TaskEventKind::Killed),
        };

        (self.on_state_change)(&self.name, Some(TaskRunState::Dead), Some(event), false);
        self.log(format!("stopped:{}", self.name));
        let _ = self.done_tx.send(true);

        debug!(task = %self.name, "[MOCK] Task runner stopped");
    }

    fn mark_received(&self) {
        self.received.store(true, Ordering::SeqCst);
        (self.on_state_change)(
            &self.name,
            None,
            Some(TaskEvent::new(TaskEventKind::Received)),
            false,
        );
    }

    fn update(&self, alloc: Allocation) {
        self.updates.lock().unwrap().push(alloc);
    }

    fn restart(&self, reason: &str, description: &str, fail: bool) {
        info!(task = %self.name, reason, "[MOCK] Restart requested");
        self.restarts.lock().unwrap().push(RestartCall {
            reason: reason.to_string(),
            description: description.to_string(),
            fail,
        });
    }

    fn destroy(&self, event: TaskEvent) {
        self.log(format!("destroy:{}:{:?}", self.name, event.kind));
        self.destroy_events.lock().unwrap().push(event.clone());
        let _ = self.stop_tx.send(StopSignal::Destroyed(event));
    }

    async fn wait(&self) {
        let mut done = self.done_rx.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                return;
            }
        }
    }

    fn save_state(&self) -> Result<()> {
        Ok(())
    }

    fn restore_state(&self) -> Result<String> {
        Ok(self.restore_reason.clone())
    }

    fn latest_resource_usage(&self) -> Option<TaskResourceUsage> {
        self.usage.lock().unwrap().clone()
    }
}

/// Factory producing [`MockTaskRunner`]s and keeping handles to them.
pub struct MockTaskRunnerFactory {
    created: Mutex<Vec<Arc<MockTaskRunner>>>,
    restore_reasons: Mutex<std::collections::BTreeMap<String, String>>,
    log: Arc<Mutex<Vec<String>>>,
}

impl MockTaskRunnerFactory {
    pub fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            restore_reasons: Mutex::new(Default::default()),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Configure the reason `restore_state` reports for a task.
    pub fn set_restore_reason(&self, task: &str, reason: &str) {
        self.restore_reasons
            .lock()
            .unwrap()
            .insert(task.to_string(), reason.to_string());
    }

    /// All runners created so far.
    pub fn created(&self) -> Vec<Arc<MockTaskRunner>> {
        self.created.lock().unwrap().clone()
    }

    /// The runner created for `name`, if any.
    pub fn runner(&self, name: &str) -> Option<Arc<MockTaskRunner>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .find(|tr| tr.name == name)
            .cloned()
    }

    /// Ordered log of destroy/stop calls across all runners.
    pub fn call_log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl Default for MockTaskRunnerFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunnerFactory for MockTaskRunnerFactory {
    fn create(&self, request: TaskRunnerRequest) -> Arc<dyn TaskRunner> {
        let reason = self
            .restore_reasons
            .lock()
            .unwrap()
            .get(&request.task.name)
            .cloned()
            .unwrap_or_default();
        let runner = Arc::new(MockTaskRunner::new(
            &request,
            reason,
            Some(self.log.clone()),
        ));
        self.created.lock().unwrap().push(runner.clone());
        runner
    }
}
