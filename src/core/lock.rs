//! Cross-process locks under `<data_dir>/locks/`.
//!
//! An operation lock makes "active operation on a work unit" single-writer
//! across every foreman process; the merge lock serializes merges into the
//! base branch.

use crate::core::error::{ForemanError, Result};
use crate::storage::state_store::encode_key;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Held lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl LockGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Clone)]
pub struct LockDir {
    dir: PathBuf,
}

impl LockDir {
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("locks"),
        }
    }

    fn open(&self, name: &str, origin: &'static str) -> Result<(File, PathBuf)> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| ForemanError::system("create_dir_failed", e.to_string(), origin))?;
        let path = self.dir.join(name);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ForemanError::system("lock_open_failed", e.to_string(), origin))?;
        Ok((file, path))
    }

    /// Claims the active-operation slot of a work unit without waiting.
    pub fn operation(&self, branch: &str, origin: &'static str) -> Result<LockGuard> {
        let (file, path) = self.open(&format!("workunit_{}.lock", encode_key(branch)), origin)?;
        file.try_lock_exclusive().map_err(|e| {
            ForemanError::conflict(
                "operation_in_progress",
                "Another operation is already in progress for this work unit",
                origin,
            )
            .for_work_unit(branch)
            .recoverable(true)
            .with_context("lock_error", e.to_string())
        })?;
        Ok(LockGuard { file, path })
    }

    /// Waits for the global merge lock.
    pub fn merge(&self, origin: &'static str) -> Result<LockGuard> {
        let (file, path) = self.open("merge.lock", origin)?;
        file.lock_exclusive()
            .map_err(|e| ForemanError::system("lock_failed", e.to_string(), origin))?;
        Ok(LockGuard { file, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operation_lock_is_exclusive_per_work_unit() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());

        let held = locks.operation("feat/x", "test").unwrap();
        assert!(held.path().ends_with("workunit_feat%2Fx.lock"));

        let err = locks.operation("feat/x", "test").unwrap_err();
        assert_eq!(err.code, "operation_in_progress");
        assert_eq!(err.subject(), Some("feat/x"));

        assert!(locks.operation("feat/y", "test").is_ok());
        drop(held);
        assert!(locks.operation("feat/x", "test").is_ok());
    }

    #[test]
    fn merge_lock_serializes_holders() {
        let dir = tempfile::tempdir().unwrap();
        let locks = LockDir::new(dir.path());
        let first = locks.merge("test").unwrap();

        let waiter_locks = locks.clone();
        let (tx, rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            let _guard = waiter_locks.merge("test").unwrap();
            tx.send(()).unwrap();
        });

        assert!(rx.recv_timeout(std::time::Duration::from_millis(100)).is_err());
        drop(first);
        assert!(rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok());
        handle.join().unwrap();
    }
}
