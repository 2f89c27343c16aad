use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use anyhow::Context;
use log::{debug, error};
use nix::fcntl::{Flock, FlockArg};

/// Host-wide mutex guarding every network mutation.
///
/// The lock file is only a handle for `flock`; its content is never read.
/// Acquisition blocks without a timeout.
#[derive(Debug, Clone)]
pub struct NetworkLock {
    path: PathBuf,
}

/// Holds the exclusive lock until dropped.
pub struct NetworkLockGuard {
    lock: Option<Flock<File>>,
}

impl NetworkLock {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> anyhow::Result<NetworkLockGuard> {
        if let Some(parent_dir) = self.path.parent() {
            std::fs::create_dir_all(parent_dir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .with_context(|| format!("open lock file {} failed", self.path.display()))?;

        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| errno)
            .context("lock network failed")?;

        debug!("Acquired network lock {}", self.path.display());

        Ok(NetworkLockGuard { lock: Some(lock) })
    }
}

impl Drop for NetworkLockGuard {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            // Closing the file releases the lock anyway, so a failed unlock
            // is only worth a log line.
            if let Err((_, errno)) = lock.unlock() {
                error!("unlock network failed: {errno}");
            }
        }
    }
}
