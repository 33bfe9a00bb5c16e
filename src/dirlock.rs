//! Advisory lock on the base persist directory.
//!
//! Exactly one appenderator may own a base persist directory at a time; the
//! lock is a non-blocking exclusive `flock` on `<base>/.lock`, held from
//! `start_job` until `close`. `close_now` deliberately leaves it held; it
//! then lasts until the lock value is dropped or the process exits.

use crate::error::{AppenderatorError, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_NAME: &str = ".lock";

/// Holds the exclusive advisory lock on a base persist directory.
pub struct DirectoryLock {
    file: File,
    path: PathBuf,
}

impl DirectoryLock {
    /// Creates `<base>/.lock` if needed and takes a non-blocking exclusive
    /// lock on it. Fails with `LockUnavailable` when another process (or
    /// another appenderator in this process) already holds it.
    pub fn acquire(base_dir: &Path) -> Result<Self> {
        let path = base_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| AppenderatorError::io_at(&path, e))?;

        Self::try_lock_exclusive(&file, &path)?;
        debug!(path = %path.display(), "Acquired base persist directory lock");
        Ok(Self { file, path })
    }

    #[cfg(unix)]
    fn try_lock_exclusive(file: &File, path: &Path) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            return if err.kind() == std::io::ErrorKind::WouldBlock {
                Err(AppenderatorError::LockUnavailable {
                    path: path.to_path_buf(),
                })
            } else {
                Err(AppenderatorError::io_at(path, err))
            };
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn try_lock_exclusive(_file: &File, _path: &Path) -> Result<()> {
        // Advisory locking is not wired up off unix; the lock file still
        // marks the directory as claimed.
        Ok(())
    }

    /// Explicitly releases the lock. Dropping the value releases it too;
    /// this exists so `close` can surface release errors.
    pub fn release(self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            let ret = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
            if ret != 0 {
                return Err(AppenderatorError::io_at(
                    &self.path,
                    std::io::Error::last_os_error(),
                ));
            }
        }
        debug!(path = %self.path.display(), "Released base persist directory lock");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn lock_is_exclusive_within_process() {
        let temp_dir = TempDir::new().unwrap();

        let first = DirectoryLock::acquire(temp_dir.path()).unwrap();
        assert!(matches!(
            DirectoryLock::acquire(temp_dir.path()),
            Err(AppenderatorError::LockUnavailable { .. })
        ));

        first.release().unwrap();
        let second = DirectoryLock::acquire(temp_dir.path()).unwrap();
        second.release().unwrap();
    }

    #[test]
    fn dropping_the_lock_releases_it() {
        let temp_dir = TempDir::new().unwrap();
        {
            let _lock = DirectoryLock::acquire(temp_dir.path()).unwrap();
        }
        let reacquired = DirectoryLock::acquire(temp_dir.path()).unwrap();
        reacquired.release().unwrap();
    }
}
