//! Durable state for allocation supervision.
//!
//! Each allocation owns one bucket in the store, holding four named
//! records. The store is transactional: a `view` or `update` closure sees a
//! consistent snapshot, and writes made in `update` land atomically.
//! Record payloads are opaque bytes to the store; the runner serializes
//! them as JSON.

mod store;

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use skiff_id::AllocId;
use skiff_model::{AllocDeploymentStatus, Allocation, ClientStatus, TaskState};
use thiserror::Error;

pub use store::SqliteStateStore;

/// Record key for the last-known allocation. Rewritten only when the
/// evaluation ID changes.
pub const ALLOC_KEY: &str = "alloc";

/// Record key for write-once immutable data.
pub const IMMUTABLE_KEY: &str = "immutable";

/// Record key for state rewritten on every sync.
pub const MUTABLE_KEY: &str = "mutable";

/// Record key for the serialized allocation directory layout.
pub const ALLOC_DIR_KEY: &str = "alloc-dir";

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("missing record '{key}' for allocation {alloc_id}")]
    MissingRecord { alloc_id: AllocId, key: &'static str },
}

/// Read view of an allocation's bucket.
pub trait AllocBucket {
    /// Fetch the raw bytes stored under `key`, if any.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError>;
}

/// Write view of an allocation's bucket, scoped to one transaction.
pub trait AllocBucketMut: AllocBucket {
    /// Store `value` under `key`, replacing any previous value.
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StateError>;

    /// Register a callback to run only after the transaction commits. An
    /// aborted transaction never runs its callbacks.
    fn on_commit(&mut self, callback: Box<dyn FnOnce() + Send>);
}

/// Durable, transactional store of per-allocation buckets.
pub trait StateStore: Send + Sync {
    /// Run a read-only closure against the allocation's bucket.
    fn view(
        &self,
        alloc_id: &AllocId,
        f: &mut dyn FnMut(&dyn AllocBucket) -> Result<(), StateError>,
    ) -> Result<(), StateError>;

    /// Run a read-write closure against the allocation's bucket inside one
    /// transaction. The closure failing aborts the transaction.
    fn update(
        &self,
        alloc_id: &AllocId,
        f: &mut dyn FnMut(&mut dyn AllocBucketMut) -> Result<(), StateError>,
    ) -> Result<(), StateError>;

    /// Delete the allocation's bucket and everything in it.
    fn delete_bucket(&self, alloc_id: &AllocId) -> Result<(), StateError>;

    /// List every allocation with a bucket in the store.
    fn list_allocs(&self) -> Result<Vec<AllocId>, StateError>;
}

/// Deserialize the record stored under `key`, if present.
pub fn get_object<T: DeserializeOwned>(
    bucket: &dyn AllocBucket,
    key: &str,
) -> Result<Option<T>, StateError> {
    match bucket.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

/// Serialize `value` and store it under `key`.
pub fn put_object<T: Serialize>(
    bucket: &mut dyn AllocBucketMut,
    key: &str,
    value: &T,
) -> Result<(), StateError> {
    let bytes = serde_json::to_vec(value)?;
    bucket.put(key, &bytes)
}

/// State that only has to be written when the allocation version changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocRecord {
    pub alloc: Allocation,
}

/// State written once per allocation lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImmutableRecord {
    /// Node agent version at first persist.
    pub agent_version: String,
}

/// State rewritten on every sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutableRecord {
    pub client_status: Option<ClientStatus>,
    pub client_description: String,
    pub task_states: BTreeMap<String, TaskState>,
    pub deployment_status: Option<AllocDeploymentStatus>,
}
