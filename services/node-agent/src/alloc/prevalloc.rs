//! Waiting on a previous allocation.
//!
//! When an allocation replaces another on the same node, the new runner
//! must not start tasks until the predecessor has terminated, and may need
//! to take over its sticky data. Runners without a predecessor use the noop
//! watcher, so calling the watcher is always safe.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use skiff_id::AllocId;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::broadcast::AllocListener;
use crate::allocdir::{AllocDir, AllocDirError};

/// Errors from waiting on or migrating from a previous allocation.
#[derive(Debug, Error)]
pub enum PrevAllocError {
    /// The wait was canceled because the runner is being destroyed.
    #[error("wait for previous allocation canceled")]
    Canceled,

    #[error(transparent)]
    Migrate(#[from] AllocDirError),
}

/// Watches a previous allocation so the runner can wait for it and migrate
/// its sticky data.
#[async_trait]
pub trait PrevAllocWatcher: Send + Sync {
    /// Block until the previous allocation has terminated.
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), PrevAllocError>;

    /// Migrate sticky data into `dest`. Called after `wait` has returned.
    fn migrate(&self, cancel: &CancellationToken, dest: &AllocDir) -> Result<(), PrevAllocError>;

    /// Whether the watcher is currently blocked in `wait`.
    fn is_waiting(&self) -> bool;

    /// Whether the watcher is currently migrating data.
    fn is_migrating(&self) -> bool;
}

/// Watcher for allocations with no predecessor.
pub struct NoopPrevAlloc;

#[async_trait]
impl PrevAllocWatcher for NoopPrevAlloc {
    async fn wait(&self, _cancel: &CancellationToken) -> Result<(), PrevAllocError> {
        Ok(())
    }

    fn migrate(&self, _cancel: &CancellationToken, _dest: &AllocDir) -> Result<(), PrevAllocError> {
        Ok(())
    }

    fn is_waiting(&self) -> bool {
        false
    }

    fn is_migrating(&self) -> bool {
        false
    }
}

/// Watcher for a predecessor running on this same node.
///
/// Waits on the predecessor runner's broadcast until a terminal snapshot
/// (or the broadcast closing, which means the predecessor was destroyed),
/// then optionally moves its sticky data subtree.
pub struct LocalPrevAlloc {
    prev_alloc_id: AllocId,
    listener: Mutex<AllocListener>,
    prev_dir: AllocDir,

    /// Whether the job declares sticky data that should migrate.
    sticky: bool,

    waiting: AtomicBool,
    migrating: AtomicBool,
}

impl LocalPrevAlloc {
    pub fn new(prev_alloc_id: AllocId, listener: AllocListener, prev_dir: AllocDir, sticky: bool) -> Self {
        Self {
            prev_alloc_id,
            listener: Mutex::new(listener),
            prev_dir,
            sticky,
            waiting: AtomicBool::new(false),
            migrating: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl PrevAllocWatcher for LocalPrevAlloc {
    async fn wait(&self, cancel: &CancellationToken) -> Result<(), PrevAllocError> {
        self.waiting.store(true, Ordering::SeqCst);
        // Reset on every exit path.
        let _guard = scopeguard(&self.waiting);

        debug!(prev_alloc_id = %self.prev_alloc_id, "Waiting for previous allocation to terminate");

        let mut listener = self.listener.lock().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Err(PrevAllocError::Canceled),
                snapshot = listener.recv() => match snapshot {
                    Some(alloc) if alloc.terminated() => {
                        info!(prev_alloc_id = %self.prev_alloc_id, "Previous allocation terminated");
                        return Ok(());
                    }
                    Some(_) => continue,
                    // Broadcast closed: the predecessor was destroyed.
                    None => return Ok(()),
                },
            }
        }
    }

    fn migrate(&self, cancel: &CancellationToken, dest: &AllocDir) -> Result<(), PrevAllocError> {
        if !self.sticky {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(PrevAllocError::Canceled);
        }

        self.migrating.store(true, Ordering::SeqCst);
        let _guard = scopeguard(&self.migrating);

        dest.move_from(&self.prev_dir)?;
        Ok(())
    }

    fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    fn is_migrating(&self) -> bool {
        self.migrating.load(Ordering::SeqCst)
    }
}

/// Clears the flag when dropped, covering every exit path.
fn scopeguard(flag: &AtomicBool) -> impl Drop + '_ {
    struct Reset<'a>(&'a AtomicBool);
    impl Drop for Reset<'_> {
        fn drop(&mut self) {
            self.0.store(false, Ordering::SeqCst);
        }
    }
    Reset(flag)
}
