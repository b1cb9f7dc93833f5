//! Resource-usage aggregation types.
//!
//! Collection itself happens in the task runners; these types only carry
//! the measurements and sum them per allocation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A point-in-time resource measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Resident memory in bytes.
    pub memory_rss_bytes: u64,

    /// CPU usage as a percentage of one core.
    pub cpu_percent: f64,
}

impl ResourceUsage {
    /// Add another measurement into this one.
    pub fn add(&mut self, other: &ResourceUsage) {
        self.memory_rss_bytes += other.memory_rss_bytes;
        self.cpu_percent += other.cpu_percent;
    }
}

/// Latest resource usage of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResourceUsage {
    /// The measurement.
    pub usage: ResourceUsage,

    /// When it was taken.
    pub timestamp: DateTime<Utc>,
}

/// Aggregated resource usage of one allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocResourceUsage {
    /// Sum over all tasks.
    pub usage: ResourceUsage,

    /// Per-task measurements.
    pub tasks: BTreeMap<String, TaskResourceUsage>,

    /// Most recent per-task timestamp.
    pub timestamp: Option<DateTime<Utc>>,
}

impl AllocResourceUsage {
    /// Aggregate a set of per-task measurements.
    pub fn from_tasks(tasks: BTreeMap<String, TaskResourceUsage>) -> Self {
        let mut usage = ResourceUsage::default();
        let mut timestamp = None;
        for task in tasks.values() {
            usage.add(&task.usage);
            if timestamp.map_or(true, |t| task.timestamp > t) {
                timestamp = Some(task.timestamp);
            }
        }
        Self {
            usage,
            tasks,
            timestamp,
        }
    }
}
