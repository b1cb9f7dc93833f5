//! Allocation lifecycle metrics.
//!
//! Two emission paths exist for every counter: a tagged path with
//! `{job, task_group, node_id}` labels, and a legacy path keyed by a single
//! dotted string, which older dashboards still scrape. Each path is
//! conditional on its configuration flag.

use prometheus::{IntCounterVec, Opts, Registry};

/// Labels attached to every tagged allocation metric.
#[derive(Debug, Clone, Default)]
pub struct BaseLabels {
    pub job: String,
    pub task_group: String,
    pub node_id: String,
}

/// The allocation lifecycle counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocCounter {
    /// Runner started supervising (also incremented on restore).
    Start,
    /// Runner was destroyed.
    Destroy,
    /// A task restarted.
    Restart,
    /// A task entered running.
    Running,
    /// A task died failed.
    Failed,
    /// A task died without failure.
    Complete,
}

impl AllocCounter {
    fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Destroy => "destroy",
            Self::Restart => "restart",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Complete => "complete",
        }
    }
}

/// Metric emitters for the node agent's allocation plane.
pub struct ClientMetrics {
    tagged: IntCounterVec,
    legacy: IntCounterVec,
    disable_tagged: bool,
    backwards_compatible: bool,
}

impl ClientMetrics {
    pub fn new(
        registry: &Registry,
        disable_tagged: bool,
        backwards_compatible: bool,
    ) -> Result<Self, prometheus::Error> {
        let tagged = IntCounterVec::new(
            Opts::new(
                "skiff_client_allocs_total",
                "Allocation lifecycle events on this node",
            ),
            &["event", "job", "task_group", "node_id"],
        )?;
        let legacy = IntCounterVec::new(
            Opts::new(
                "skiff_client_allocs_legacy_total",
                "Allocation lifecycle events keyed by dotted path",
            ),
            &["path"],
        )?;
        registry.register(Box::new(tagged.clone()))?;
        registry.register(Box::new(legacy.clone()))?;

        Ok(Self {
            tagged,
            legacy,
            disable_tagged,
            backwards_compatible,
        })
    }

    /// Increment an allocation counter on the enabled emission paths.
    /// `task` extends the legacy path for per-task counters.
    pub fn incr_alloc(&self, counter: AllocCounter, base: &BaseLabels, task: Option<&str>) {
        if !self.disable_tagged {
            self.tagged
                .with_label_values(&[counter.name(), &base.job, &base.task_group, &base.node_id])
                .inc();
        }
        if self.backwards_compatible {
            let path = match task {
                Some(task) => format!(
                    "client.allocs.{}.{}.{}.{}",
                    base.job,
                    base.task_group,
                    task,
                    counter.name()
                ),
                None => format!(
                    "client.allocs.{}.{}.{}",
                    base.job,
                    base.task_group,
                    counter.name()
                ),
            };
            self.legacy.with_label_values(&[&path]).inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> BaseLabels {
        BaseLabels {
            job: "web".to_string(),
            task_group: "g1".to_string(),
            node_id: "node_test".to_string(),
        }
    }

    #[test]
    fn test_tagged_path() {
        let registry = Registry::new();
        let metrics = ClientMetrics::new(&registry, false, false).unwrap();

        metrics.incr_alloc(AllocCounter::Start, &labels(), None);
        metrics.incr_alloc(AllocCounter::Start, &labels(), None);

        let value = metrics
            .tagged
            .with_label_values(&["start", "web", "g1", "node_test"])
            .get();
        assert_eq!(value, 2);
    }

    #[test]
    fn test_legacy_path_behind_flag() {
        let registry = Registry::new();
        let metrics = ClientMetrics::new(&registry, false, true).unwrap();

        metrics.incr_alloc(AllocCounter::Restart, &labels(), Some("t1"));

        let value = metrics
            .legacy
            .with_label_values(&["client.allocs.web.g1.t1.restart"])
            .get();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_tagged_path_disabled() {
        let registry = Registry::new();
        let metrics = ClientMetrics::new(&registry, true, false).unwrap();

        metrics.incr_alloc(AllocCounter::Failed, &labels(), Some("t1"));

        let value = metrics
            .tagged
            .with_label_values(&["failed", "web", "g1", "node_test"])
            .get();
        assert_eq!(value, 0);
    }
}
