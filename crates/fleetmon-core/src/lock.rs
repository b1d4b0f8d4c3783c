//! Cross-process run lock
//!
//! At most one installation may run against a given configuration file.
//! The lock is an OS advisory lock on `<config>.lock` and is never
//! waited on: contention is an immediate error so the caller decides
//! whether to retry.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, warn};

/// Lock acquisition errors
#[derive(Error, Debug)]
pub enum LockError {
    /// Somebody else holds the lock
    #[error("lock on [{0}] is held by another process")]
    Contended(String),

    /// The lock file could not be created or opened
    #[error("failed to open lock file: {0}")]
    Io(#[from] std::io::Error),
}

/// Exclusive, non-blocking lock scoped to one configuration file.
///
/// Released on drop.
#[derive(Debug)]
pub struct InstallLock {
    file: File,
    path: PathBuf,
}

impl InstallLock {
    /// Acquire the lock for `config_path`, failing immediately on
    /// contention.
    ///
    /// # Errors
    /// [`LockError::Contended`] when another process holds the lock,
    /// [`LockError::Io`] when the lock file cannot be opened.
    pub fn acquire(config_path: &Path) -> Result<Self, LockError> {
        let path = lock_path(config_path);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|_| LockError::Contended(path.display().to_string()))?;

        debug!(path = %path.display(), "acquired install lock");
        Ok(Self { file, path })
    }

    /// Path of the lock file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release install lock");
        }
    }
}

fn lock_path(config_path: &Path) -> PathBuf {
    let mut name = config_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    config_path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_path_beside_config() {
        assert_eq!(
            lock_path(Path::new("/etc/fleetmon.conf")),
            PathBuf::from("/etc/fleetmon.conf.lock")
        );
    }

    #[test]
    fn test_contention_detected() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("fleetmon.conf");
        std::fs::write(&config, "ssh_hosts: []").unwrap();

        let held = InstallLock::acquire(&config).unwrap();
        let second = InstallLock::acquire(&config);
        assert!(matches!(second, Err(LockError::Contended(_))));

        drop(held);
        InstallLock::acquire(&config).unwrap();
    }

    #[test]
    fn test_different_configs_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("a.conf");
        let second = dir.path().join("b.conf");
        std::fs::write(&first, "").unwrap();
        std::fs::write(&second, "").unwrap();

        let _a = InstallLock::acquire(&first).unwrap();
        let _b = InstallLock::acquire(&second).unwrap();
    }
}
