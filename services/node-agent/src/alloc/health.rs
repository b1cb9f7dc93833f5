//! Deployment health observation.
//!
//! A cancellable worker watches the runner's own snapshot broadcast and
//! decides whether the allocation is healthy for its deployment. The
//! decision is reported back to the runner, which folds it into subsequent
//! snapshots. Allocations that are not part of a deployment have nothing to
//! observe.

use std::sync::Arc;
use std::time::Duration;

use skiff_model::{Allocation, ClientStatus, TaskRunState};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::broadcast::AllocListener;

/// How long every task must stay running before the allocation counts as
/// healthy.
pub const MIN_HEALTHY_TIME: Duration = Duration::from_secs(10);

/// Callback reporting a health decision to the runner.
pub type HealthSetterFn = Arc<dyn Fn(bool) + Send + Sync>;

/// Observe snapshots until a health decision is reached, the watcher is
/// canceled, or the broadcast closes.
///
/// The allocation is healthy once every task has been running for
/// `min_healthy_time` without interruption, and unhealthy as soon as its
/// derived status is failed.
pub async fn watch_health(
    cancel: CancellationToken,
    mut listener: AllocListener,
    initial: Allocation,
    min_healthy_time: Duration,
    set_health: HealthSetterFn,
) {
    if initial.deployment_id.is_none() {
        return;
    }

    debug!(alloc_id = %initial.id, "Watching allocation health");

    let mut healthy_since: Option<Instant> = None;
    if is_failed(&initial) {
        set_health(false);
        return;
    }
    if all_tasks_running(&initial) {
        healthy_since = Some(Instant::now());
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            snapshot = listener.recv() => match snapshot {
                Some(alloc) => {
                    if is_failed(&alloc) {
                        set_health(false);
                        return;
                    }
                    if alloc.terminated() {
                        return;
                    }
                    healthy_since = match (healthy_since, all_tasks_running(&alloc)) {
                        // Keep the original clock while tasks stay up.
                        (Some(since), true) => Some(since),
                        (None, true) => Some(Instant::now()),
                        (_, false) => None,
                    };
                }
                None => return,
            },

            _ = wait_for_deadline(healthy_since, min_healthy_time) => {
                set_health(true);
                return;
            }
        }
    }
}

fn is_failed(alloc: &Allocation) -> bool {
    alloc.client_status == ClientStatus::Failed
}

fn all_tasks_running(alloc: &Allocation) -> bool {
    !alloc.task_states.is_empty()
        && alloc
            .task_states
            .values()
            .all(|ts| ts.state == TaskRunState::Running)
}

async fn wait_for_deadline(since: Option<Instant>, min_healthy_time: Duration) {
    match since {
        Some(since) => sleep_until(since + min_healthy_time).await,
        None => std::future::pending::<()>().await,
    }
}
