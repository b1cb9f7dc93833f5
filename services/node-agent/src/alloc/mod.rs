//! Allocation supervision.
//!
//! One [`AllocRunner`] per assigned allocation, composing a task runner per
//! task, a health watcher, a snapshot broadcaster, and a watcher for the
//! allocation it replaces.

pub mod broadcast;
pub mod health;
pub mod prevalloc;
pub mod runner;
pub mod taskrunner;

pub use broadcast::{AllocBroadcaster, AllocListener};
pub use prevalloc::{LocalPrevAlloc, NoopPrevAlloc, PrevAllocError, PrevAllocWatcher};
pub use runner::{AllocRunner, AllocRunnerDeps, AllocUpdaterFn, RestoreError};
pub use taskrunner::{
    MockTaskRunner, MockTaskRunnerFactory, TaskRunner, TaskRunnerFactory, TaskRunnerRequest,
    TaskStateUpdateFn,
};
