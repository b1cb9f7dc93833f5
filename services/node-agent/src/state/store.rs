//! SQLite-backed state store.
//!
//! Buckets are rows in a single `alloc_state` table keyed by
//! `(alloc_id, key)`. `update` closures run inside one SQLite transaction,
//! so the four records of an allocation land atomically.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Transaction};
use skiff_id::AllocId;
use tracing::debug;

use super::{AllocBucket, AllocBucketMut, StateError, StateStore};

/// SQLite state store.
pub struct SqliteStateStore {
    conn: Mutex<Connection>,
}

impl SqliteStateStore {
    /// Open or create a state store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StateError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS alloc_state (
                alloc_id TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (alloc_id, key)
            );
            "#,
        )?;

        debug!("State store schema initialized");
        Ok(())
    }
}

impl StateStore for SqliteStateStore {
    fn view(
        &self,
        alloc_id: &AllocId,
        f: &mut dyn FnMut(&dyn AllocBucket) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let bucket = TxBucket {
            tx: &tx,
            alloc_id: alloc_id.to_string(),
        };
        f(&bucket)?;
        tx.commit()?;
        Ok(())
    }

    fn update(
        &self,
        alloc_id: &AllocId,
        f: &mut dyn FnMut(&mut dyn AllocBucketMut) -> Result<(), StateError>,
    ) -> Result<(), StateError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut hooks: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        {
            let mut bucket = TxBucketMut {
                tx: &tx,
                alloc_id: alloc_id.to_string(),
                hooks: &mut hooks,
            };
            f(&mut bucket)?;
        }
        tx.commit()?;

        // Commit callbacks run only after a successful commit.
        for hook in hooks {
            hook();
        }
        Ok(())
    }

    fn delete_bucket(&self, alloc_id: &AllocId) -> Result<(), StateError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM alloc_state WHERE alloc_id = ?1",
            params![alloc_id.to_string()],
        )?;
        Ok(())
    }

    fn list_allocs(&self) -> Result<Vec<AllocId>, StateError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT DISTINCT alloc_id FROM alloc_state")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        // Rows with unparseable IDs would have been written by a different
        // schema; surface them as absent rather than failing the listing.
        Ok(ids
            .into_iter()
            .filter_map(|s| AllocId::parse(&s).ok())
            .collect())
    }
}

fn get_row(tx: &Transaction<'_>, alloc_id: &str, key: &str) -> Result<Option<Vec<u8>>, StateError> {
    let value = tx
        .query_row(
            "SELECT value FROM alloc_state WHERE alloc_id = ?1 AND key = ?2",
            params![alloc_id, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

struct TxBucket<'a, 'tx> {
    tx: &'a Transaction<'tx>,
    alloc_id: String,
}

impl AllocBucket for TxBucket<'_, '_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        get_row(self.tx, &self.alloc_id, key)
    }
}

struct TxBucketMut<'a, 'tx> {
    tx: &'a Transaction<'tx>,
    alloc_id: String,
    hooks: &'a mut Vec<Box<dyn FnOnce() + Send>>,
}

impl AllocBucket for TxBucketMut<'_, '_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StateError> {
        get_row(self.tx, &self.alloc_id, key)
    }
}

impl AllocBucketMut for TxBucketMut<'_, '_> {
    fn put(&mut self, key: &str, value: &[u8]) -> Result<(), StateError> {
        self.tx.execute(
            r#"
            INSERT INTO alloc_state (alloc_id, key, value) VALUES (?1, ?2, ?3)
            ON CONFLICT(alloc_id, key) DO UPDATE SET value = excluded.value
            "#,
            params![self.alloc_id, key, value],
        )?;
        Ok(())
    }

    fn on_commit(&mut self, callback: Box<dyn FnOnce() + Send>) {
        self.hooks.push(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_bucket_roundtrip() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let alloc_id = AllocId::new();

        store
            .update(&alloc_id, &mut |bkt| bkt.put("mutable", b"hello"))
            .unwrap();

        let mut fetched = None;
        store
            .view(&alloc_id, &mut |bkt| {
                fetched = bkt.get("mutable")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"hello"[..]));

        // Overwrite replaces.
        store
            .update(&alloc_id, &mut |bkt| bkt.put("mutable", b"world"))
            .unwrap();
        store
            .view(&alloc_id, &mut |bkt| {
                fetched = bkt.get("mutable")?;
                Ok(())
            })
            .unwrap();
        assert_eq!(fetched.as_deref(), Some(&b"world"[..]));
    }

    #[test]
    fn test_commit_hook_skipped_on_abort() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let alloc_id = AllocId::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        let result = store.update(&alloc_id, &mut move |bkt| {
            bkt.put("immutable", b"v1")?;
            let flag = flag.clone();
            bkt.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));
            Err(StateError::MissingRecord {
                alloc_id: AllocId::new(),
                key: "forced",
            })
        });

        assert!(result.is_err());
        assert!(!fired.load(Ordering::SeqCst));

        // The aborted write must not be visible.
        let mut value = None;
        store
            .view(&alloc_id, &mut |bkt| {
                value = bkt.get("immutable")?;
                Ok(())
            })
            .unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_commit_hook_fires_on_commit() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let alloc_id = AllocId::new();
        let fired = Arc::new(AtomicBool::new(false));

        let flag = fired.clone();
        store
            .update(&alloc_id, &mut move |bkt| {
                bkt.put("immutable", b"v1")?;
                let flag = flag.clone();
                bkt.on_commit(Box::new(move || flag.store(true, Ordering::SeqCst)));
                Ok(())
            })
            .unwrap();

        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn test_delete_bucket_and_listing() {
        let store = SqliteStateStore::open_in_memory().unwrap();
        let a = AllocId::new();
        let b = AllocId::new();

        for id in [&a, &b] {
            store
                .update(id, &mut |bkt| bkt.put("mutable", b"{}"))
                .unwrap();
        }

        let mut listed = store.list_allocs().unwrap();
        listed.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(listed, expected);

        store.delete_bucket(&a).unwrap();
        assert_eq!(store.list_allocs().unwrap(), vec![b]);
    }
}
