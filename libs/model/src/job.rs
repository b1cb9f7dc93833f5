//! Job, task group, and task definitions.
//!
//! The job subtree is immutable once submitted; the node agent shares it by
//! reference and never mutates it.

use serde::{Deserialize, Serialize};
use skiff_id::JobId;

/// A submitted job: a named set of task groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job ID.
    pub id: JobId,

    /// User-facing job name.
    pub name: String,

    /// Task groups in this job.
    pub task_groups: Vec<TaskGroup>,
}

impl Job {
    /// Look up a task group by name.
    pub fn task_group(&self, name: &str) -> Option<&TaskGroup> {
        self.task_groups.iter().find(|tg| tg.name == name)
    }
}

/// A set of tasks that must be co-scheduled on the same node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroup {
    /// Group name, unique within the job.
    pub name: String,

    /// Tasks in this group. Task names are unique within the group.
    pub tasks: Vec<Task>,
}

impl TaskGroup {
    /// The leader task of this group, if one is declared.
    pub fn leader(&self) -> Option<&Task> {
        self.tasks.iter().find(|t| t.leader)
    }
}

/// A single unit of work, a leaf of the supervision tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Task name, unique within its group.
    pub name: String,

    /// Whether this task is the group leader. The leader's death shuts
    /// down every sibling.
    #[serde(default)]
    pub leader: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job {
            id: JobId::new(),
            name: "web".to_string(),
            task_groups: vec![TaskGroup {
                name: "g1".to_string(),
                tasks: vec![
                    Task {
                        name: "t1".to_string(),
                        leader: true,
                    },
                    Task {
                        name: "t2".to_string(),
                        leader: false,
                    },
                ],
            }],
        }
    }

    #[test]
    fn test_task_group_lookup() {
        let job = job();
        assert!(job.task_group("g1").is_some());
        assert!(job.task_group("missing").is_none());
    }

    #[test]
    fn test_leader_lookup() {
        let job = job();
        let tg = job.task_group("g1").unwrap();
        assert_eq!(tg.leader().unwrap().name, "t1");
    }
}
