//! Allocation state as tracked by the node agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_id::{AllocId, DeployId, EvalId, NodeId};

use crate::job::Job;
use crate::task_state::{TaskRunState, TaskState};

/// Desired status of an allocation as decided by the control plane.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    /// The allocation should be running.
    #[default]
    Run,
    /// The allocation should stop.
    Stop,
    /// The allocation should be evicted from the node.
    Evict,
}

/// Client-observed status of an allocation, derived from its task states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    /// No task has started yet.
    #[default]
    Pending,
    /// At least one task is running.
    Running,
    /// All tasks exited without failure.
    Complete,
    /// At least one task failed.
    Failed,
}

impl ClientStatus {
    /// Whether this status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ClientStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of an allocation that is part of a deployment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocDeploymentStatus {
    /// Tri-state health: unset while undecided.
    pub healthy: Option<bool>,

    /// When health was decided.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AllocDeploymentStatus {
    /// Whether health has been decided as unhealthy.
    pub fn is_unhealthy(&self) -> bool {
        self.healthy == Some(false)
    }
}

/// An assignment of one task group to one node.
///
/// The job subtree is immutable and shared by reference: cloning an
/// `Allocation` is a shallow copy that skips the job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    /// Allocation ID. Never changes after construction.
    pub id: AllocId,

    /// Node this allocation is placed on.
    pub node_id: NodeId,

    /// The job this allocation belongs to.
    pub job: Arc<Job>,

    /// Name of the task group within the job.
    pub task_group: String,

    /// ID of the evaluation that produced this allocation version. Changes
    /// every time the control plane re-evaluates.
    pub eval_id: EvalId,

    /// Deployment this allocation is part of, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<DeployId>,

    /// Monotonic modify index assigned by the control plane.
    #[serde(default)]
    pub alloc_modify_index: u64,

    /// Desired status per the control plane.
    #[serde(default)]
    pub desired_status: DesiredStatus,

    /// Client-observed status.
    #[serde(default)]
    pub client_status: ClientStatus,

    /// Free-form detail accompanying `client_status`.
    #[serde(default)]
    pub client_description: String,

    /// Per-task lifecycle records.
    #[serde(default)]
    pub task_states: BTreeMap<String, TaskState>,

    /// Deployment health, when part of a deployment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_status: Option<AllocDeploymentStatus>,
}

impl Allocation {
    /// Look up this allocation's task group in its job.
    pub fn lookup_task_group(&self) -> Option<&crate::job::TaskGroup> {
        self.job.task_group(&self.task_group)
    }

    /// Whether the allocation is terminal from the server's point of view:
    /// either the desired status is no longer `Run`, or the client status
    /// is terminal.
    pub fn terminal_status(&self) -> bool {
        self.desired_status != DesiredStatus::Run || self.terminated()
    }

    /// Whether the client status is terminal.
    pub fn terminated(&self) -> bool {
        self.client_status.is_terminal()
    }
}

/// Compute the client status dictated by a set of task states.
///
/// Precedence: failed dominates running dominates pending dominates
/// complete. Returns `None` for an empty set.
pub fn derive_client_status(task_states: &BTreeMap<String, TaskState>) -> Option<ClientStatus> {
    let mut pending = false;
    let mut running = false;
    let mut dead = false;
    let mut failed = false;

    for state in task_states.values() {
        match state.state {
            TaskRunState::Running => running = true,
            TaskRunState::Pending => pending = true,
            TaskRunState::Dead => {
                if state.failed {
                    failed = true;
                } else {
                    dead = true;
                }
            }
        }
    }

    if failed {
        Some(ClientStatus::Failed)
    } else if running {
        Some(ClientStatus::Running)
    } else if pending {
        Some(ClientStatus::Pending)
    } else if dead {
        Some(ClientStatus::Complete)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn states(entries: &[(&str, TaskRunState, bool)]) -> BTreeMap<String, TaskState> {
        entries
            .iter()
            .map(|(name, state, failed)| {
                (
                    name.to_string(),
                    TaskState {
                        state: *state,
                        failed: *failed,
                        ..Default::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_derive_client_status_precedence() {
        use TaskRunState::*;

        // Failed dominates everything.
        let s = states(&[("a", Dead, true), ("b", Running, false), ("c", Pending, false)]);
        assert_eq!(derive_client_status(&s), Some(ClientStatus::Failed));

        // Running dominates pending and complete.
        let s = states(&[("a", Running, false), ("b", Pending, false), ("c", Dead, false)]);
        assert_eq!(derive_client_status(&s), Some(ClientStatus::Running));

        // Pending dominates complete.
        let s = states(&[("a", Pending, false), ("b", Dead, false)]);
        assert_eq!(derive_client_status(&s), Some(ClientStatus::Pending));

        // All dead without failure is complete.
        let s = states(&[("a", Dead, false), ("b", Dead, false)]);
        assert_eq!(derive_client_status(&s), Some(ClientStatus::Complete));

        // Empty set has no status.
        assert_eq!(derive_client_status(&BTreeMap::new()), None);
    }

    #[test]
    fn test_terminal_status() {
        use skiff_id::JobId;

        let mut alloc = Allocation {
            id: AllocId::new(),
            node_id: NodeId::new(),
            job: Arc::new(Job {
                id: JobId::new(),
                name: "web".to_string(),
                task_groups: vec![],
            }),
            task_group: "g1".to_string(),
            eval_id: EvalId::new(),
            deployment_id: None,
            alloc_modify_index: 0,
            desired_status: DesiredStatus::Run,
            client_status: ClientStatus::Running,
            client_description: String::new(),
            task_states: BTreeMap::new(),
            deployment_status: None,
        };
        assert!(!alloc.terminal_status());

        alloc.desired_status = DesiredStatus::Stop;
        assert!(alloc.terminal_status());
        assert!(!alloc.terminated());

        alloc.desired_status = DesiredStatus::Run;
        alloc.client_status = ClientStatus::Failed;
        assert!(alloc.terminal_status());
        assert!(alloc.terminated());
    }

    #[test]
    fn test_deployment_status_unhealthy() {
        let mut status = AllocDeploymentStatus::default();
        assert!(!status.is_unhealthy());
        status.healthy = Some(false);
        assert!(status.is_unhealthy());
    }
}
