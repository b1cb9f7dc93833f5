//! On-disk layout of one allocation.
//!
//! Every allocation owns a directory under the agent's alloc root:
//!
//! ```text
//! <alloc_root>/<alloc_id>/
//! ├── alloc/            shared between tasks
//! │   ├── data/         sticky data, migrated between allocations
//! │   ├── logs/
//! │   └── tmp/
//! └── <task>/           one per task
//!     ├── local/
//!     └── secrets/
//! ```
//!
//! `build` is idempotent and the layout serializes, so a restored agent can
//! pick the directory back up from the state store.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use skiff_id::AllocId;
use thiserror::Error;
use tracing::debug;

/// Name of the shared directory inside an allocation directory.
const SHARED_DIR_NAME: &str = "alloc";

/// Subdirectories of the shared directory. `data` is the sticky subtree.
const SHARED_SUBDIRS: [&str; 3] = ["data", "logs", "tmp"];

/// Subdirectories of each task directory.
const TASK_SUBDIRS: [&str; 2] = ["local", "secrets"];

/// Errors from allocation directory operations.
#[derive(Debug, Error)]
pub enum AllocDirError {
    #[error("failed to {action} {path}: {source}")]
    Io {
        action: &'static str,
        path: PathBuf,
        source: io::Error,
    },
}

fn io_err(action: &'static str, path: &Path) -> impl FnOnce(io::Error) -> AllocDirError {
    let path = path.to_path_buf();
    move |source| AllocDirError::Io {
        action,
        path,
        source,
    }
}

/// Directory of a single task within an allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDir {
    /// Root of the task directory.
    pub dir: PathBuf,

    /// Task-private scratch space.
    pub local_dir: PathBuf,

    /// Secrets directory, unmounted before the allocation dir is destroyed.
    pub secrets_dir: PathBuf,
}

/// The on-disk directory owned by one allocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocDir {
    /// Root of the allocation directory.
    alloc_dir: PathBuf,

    /// Shared directory visible to every task.
    shared_dir: PathBuf,

    /// Per-task directories by task name.
    task_dirs: BTreeMap<String, TaskDir>,

    /// Whether `build` has completed at least once.
    built: bool,
}

impl AllocDir {
    /// Describe the directory for an allocation. Nothing is created until
    /// `build` is called.
    pub fn new(alloc_root: &Path, alloc_id: &AllocId) -> Self {
        let alloc_dir = alloc_root.join(alloc_id.to_string());
        let shared_dir = alloc_dir.join(SHARED_DIR_NAME);
        Self {
            alloc_dir,
            shared_dir,
            task_dirs: BTreeMap::new(),
            built: false,
        }
    }

    /// Root path of the allocation directory.
    pub fn path(&self) -> &Path {
        &self.alloc_dir
    }

    /// Path of the shared directory.
    pub fn shared_path(&self) -> &Path {
        &self.shared_dir
    }

    /// Path of the sticky data subtree.
    pub fn data_path(&self) -> PathBuf {
        self.shared_dir.join("data")
    }

    /// Look up a task directory by name.
    pub fn task_dir(&self, name: &str) -> Option<&TaskDir> {
        self.task_dirs.get(name)
    }

    /// Create the allocation and shared directories. Idempotent.
    pub fn build(&mut self) -> Result<(), AllocDirError> {
        fs::create_dir_all(&self.alloc_dir).map_err(io_err("create", &self.alloc_dir))?;
        for sub in SHARED_SUBDIRS {
            let path = self.shared_dir.join(sub);
            fs::create_dir_all(&path).map_err(io_err("create", &path))?;
        }
        self.built = true;
        debug!(path = %self.alloc_dir.display(), "Built allocation directory");
        Ok(())
    }

    /// Create (or re-create the metadata for) a task directory. Idempotent;
    /// restoring an allocation calls this for task directories that may
    /// already exist on disk.
    pub fn new_task_dir(&mut self, name: &str) -> Result<TaskDir, AllocDirError> {
        let dir = self.alloc_dir.join(name);
        let task_dir = TaskDir {
            local_dir: dir.join("local"),
            secrets_dir: dir.join("secrets"),
            dir,
        };
        for sub in TASK_SUBDIRS {
            let path = task_dir.dir.join(sub);
            fs::create_dir_all(&path).map_err(io_err("create", &path))?;
        }
        self.task_dirs.insert(name.to_string(), task_dir.clone());
        Ok(task_dir)
    }

    /// Move the sticky data of a previous allocation's directory into this
    /// one. The previous subtree is consumed.
    pub fn move_from(&self, prev: &AllocDir) -> Result<(), AllocDirError> {
        let src = prev.data_path();
        let dst = self.data_path();
        if !src.exists() {
            return Ok(());
        }
        if dst.exists() {
            fs::remove_dir_all(&dst).map_err(io_err("remove", &dst))?;
        }
        fs::rename(&src, &dst).map_err(io_err("move", &src))?;
        debug!(
            from = %src.display(),
            to = %dst.display(),
            "Migrated sticky data from previous allocation"
        );
        Ok(())
    }

    /// Unmount anything mounted into task directories. Idempotent, and must
    /// precede `destroy`. Secrets directories are backed by mounts the tasks
    /// no longer need once the allocation stops.
    pub fn unmount_all(&self) -> Result<(), AllocDirError> {
        for task_dir in self.task_dirs.values() {
            if task_dir.secrets_dir.exists() {
                fs::remove_dir_all(&task_dir.secrets_dir)
                    .map_err(io_err("unmount", &task_dir.secrets_dir))?;
            }
        }
        Ok(())
    }

    /// Remove the allocation directory from disk.
    pub fn destroy(&self) -> Result<(), AllocDirError> {
        if self.alloc_dir.exists() {
            fs::remove_dir_all(&self.alloc_dir).map_err(io_err("remove", &self.alloc_dir))?;
        }
        debug!(path = %self.alloc_dir.display(), "Destroyed allocation directory");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = AllocDir::new(tmp.path(), &AllocId::new());

        dir.build().unwrap();
        assert!(dir.shared_path().join("data").is_dir());

        // Second build is a no-op.
        dir.build().unwrap();
        assert!(dir.shared_path().join("logs").is_dir());
    }

    #[test]
    fn test_task_dir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = AllocDir::new(tmp.path(), &AllocId::new());
        dir.build().unwrap();

        let td = dir.new_task_dir("web").unwrap();
        assert!(td.local_dir.is_dir());
        assert!(td.secrets_dir.is_dir());
        assert_eq!(dir.task_dir("web").unwrap().dir, td.dir);
    }

    #[test]
    fn test_move_from_migrates_data() {
        let tmp = tempfile::tempdir().unwrap();
        let mut prev = AllocDir::new(tmp.path(), &AllocId::new());
        prev.build().unwrap();
        fs::write(prev.data_path().join("sticky.txt"), b"keep me").unwrap();

        let mut next = AllocDir::new(tmp.path(), &AllocId::new());
        next.build().unwrap();
        next.move_from(&prev).unwrap();

        let migrated = next.data_path().join("sticky.txt");
        assert_eq!(fs::read(migrated).unwrap(), b"keep me");
        assert!(!prev.data_path().exists());
    }

    #[test]
    fn test_unmount_then_destroy() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = AllocDir::new(tmp.path(), &AllocId::new());
        dir.build().unwrap();
        dir.new_task_dir("web").unwrap();

        dir.unmount_all().unwrap();
        // unmount_all is idempotent.
        dir.unmount_all().unwrap();

        dir.destroy().unwrap();
        assert!(!dir.path().exists());
        // destroy is idempotent too.
        dir.destroy().unwrap();
    }

    #[test]
    fn test_layout_serde_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let mut dir = AllocDir::new(tmp.path(), &AllocId::new());
        dir.build().unwrap();
        dir.new_task_dir("web").unwrap();

        let json = serde_json::to_string(&dir).unwrap();
        let back: AllocDir = serde_json::from_str(&json).unwrap();
        assert_eq!(back.path(), dir.path());
        assert!(back.task_dir("web").is_some());
    }
}
