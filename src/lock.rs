//! Duplicate-instance guard.
//!
//! The daemon takes an exclusive OS lock on a file under the station root and
//! holds it for its whole lifetime. The lock disappears with the process, so a
//! crash never leaves a stale guard behind. The file content (`pid@host`) is
//! informational only.

use crate::error::{DaqError, DaqResult};
use std::fs::{File, OpenOptions, TryLockError};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Held instance lock; released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock or fail with [`DaqError::AlreadyRunning`].
    pub fn acquire(path: &Path) -> DaqResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        match file.try_lock() {
            Ok(()) => {}
            Err(TryLockError::WouldBlock) => {
                return Err(DaqError::AlreadyRunning(path.to_path_buf()));
            }
            Err(TryLockError::Error(err)) => return Err(err.into()),
        }

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        file.set_len(0)?;
        writeln!(file, "{}@{}", std::process::id(), host)?;
        file.flush()?;

        tracing::debug!(lock = %path.display(), "instance lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            tracing::warn!(lock = %self.path.display(), error = %err, "failed to release instance lock");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_instance_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("station-daq.lock");

        let first = InstanceLock::acquire(&path).unwrap();
        let content = std::fs::read_to_string(first.path()).unwrap();
        assert!(content.starts_with(&std::process::id().to_string()));

        let second = InstanceLock::acquire(&path);
        assert!(matches!(second, Err(DaqError::AlreadyRunning(_))));

        drop(first);
        assert!(InstanceLock::acquire(&path).is_ok());
    }
}
