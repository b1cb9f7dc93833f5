//! Per-task lifecycle state and events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of events retained per task. Oldest events are dropped
/// when the ring overflows.
pub const MAX_TASK_EVENTS: usize = 10;

/// Lifecycle state of a single task.
///
/// `Dead` is terminal: a task never transitions back out of it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunState {
    /// Task has been received but not started.
    #[default]
    Pending,
    /// Task is running.
    Running,
    /// Task has exited and will not run again on this allocation.
    Dead,
}

impl TaskRunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Dead => "dead",
        }
    }
}

impl std::fmt::Display for TaskRunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of a task event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEventKind {
    /// Task was received by the node agent.
    Received,
    /// Task runtime is being set up.
    Setup,
    /// Task process started.
    Started,
    /// Task process exited.
    Terminated,
    /// Task is being restarted.
    Restarting,
    /// Task exited and will not be restarted.
    NotRestarting,
    /// Task is being killed.
    Killing,
    /// Task was killed.
    Killed,
    /// A sibling task failed, killing this task.
    SiblingFailed,
    /// The group leader died, killing this task.
    LeaderDead,
}

/// An event in a task's history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    /// Event kind.
    pub kind: TaskEventKind,

    /// When the event occurred.
    pub time: DateTime<Utc>,

    /// Whether this event marks the task as failed.
    #[serde(default)]
    pub fails_task: bool,

    /// Human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Reason for a restart, when `kind` is `Restarting`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_reason: Option<String>,

    /// Name of the failed sibling, when `kind` is `SiblingFailed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_sibling: Option<String>,
}

impl TaskEvent {
    /// Create an event of the given kind stamped with the current time.
    pub fn new(kind: TaskEventKind) -> Self {
        Self {
            kind,
            time: Utc::now(),
            fails_task: false,
            message: None,
            restart_reason: None,
            failed_sibling: None,
        }
    }

    /// Mark this event as failing the task.
    pub fn fails_task(mut self) -> Self {
        self.fails_task = true;
        self
    }

    /// Attach a human-readable message.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach a restart reason.
    pub fn with_restart_reason(mut self, reason: impl Into<String>) -> Self {
        self.restart_reason = Some(reason.into());
        self
    }

    /// Attach the name of the failed sibling.
    pub fn with_failed_sibling(mut self, sibling: impl Into<String>) -> Self {
        self.failed_sibling = Some(sibling.into());
        self
    }
}

/// Full lifecycle record of one task within an allocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskState {
    /// Current state.
    pub state: TaskRunState,

    /// Whether the task has failed.
    #[serde(default)]
    pub failed: bool,

    /// Number of restarts.
    #[serde(default)]
    pub restarts: u64,

    /// Time of the most recent restart.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_restart: Option<DateTime<Utc>>,

    /// Set once, when the task first enters `Running`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Set once, when the task enters `Dead`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Bounded ring of the most recent events, oldest first.
    #[serde(default)]
    pub events: Vec<TaskEvent>,
}

impl TaskState {
    /// Append an event, dropping the oldest when the ring is full.
    pub fn append_event(&mut self, event: TaskEvent) {
        if self.events.len() == MAX_TASK_EVENTS {
            self.events.remove(0);
        }
        self.events.push(event);
    }
}
