//! File-based advisory lock guaranteeing a single manager process.
//!
//! The lockfile holds the owning PID. A lockfile whose mtime is older than
//! the staleness bound is treated as abandoned by a crashed manager and may
//! be stolen.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;

use crate::errors::LockError;

#[derive(Debug, Clone)]
pub struct LockOptions {
    /// Age after which an existing lockfile may be stolen.
    pub stale_ms: u64,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            stale_ms: 10 * 60 * 1000,
            retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

pub struct ManagerLock {
    path: PathBuf,
    file: Option<File>,
}

impl ManagerLock {
    /// Acquire the lock, stealing a stale lockfile if its mtime is older
    /// than `stale_ms`.
    pub fn acquire(path: &Path, options: &LockOptions) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        for attempt in 0..=options.retries {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    // Guard against same-process double acquisition.
                    file.try_lock_exclusive().map_err(io_err)?;
                    write!(file, "{}", std::process::id()).map_err(io_err)?;
                    file.flush().map_err(io_err)?;
                    return Ok(Self {
                        path: path.to_path_buf(),
                        file: Some(file),
                    });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    if lockfile_is_stale(path, options.stale_ms) {
                        tracing::warn!(path = %path.display(), "stealing stale manager lock");
                        let _ = std::fs::remove_file(path);
                        continue;
                    }
                    if attempt < options.retries {
                        std::thread::sleep(options.retry_delay);
                        continue;
                    }
                    return Err(LockError::Contended {
                        path: path.to_path_buf(),
                    });
                }
                Err(source) => return Err(io_err(source)),
            }
        }

        Err(LockError::Contended {
            path: path.to_path_buf(),
        })
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = fs2::FileExt::unlock(&file);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for ManagerLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn lockfile_is_stale(path: &Path, stale_ms: u64) -> bool {
    let Ok(metadata) = std::fs::metadata(path) else {
        // Vanished between the failed create and this check; retry will win.
        return false;
    };
    let Ok(modified) = metadata.modified() else {
        return false;
    };
    match modified.elapsed() {
        Ok(age) => age >= Duration::from_millis(stale_ms),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_options() -> LockOptions {
        LockOptions {
            stale_ms: 60_000,
            retries: 1,
            retry_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_acquire_writes_pid_and_release_removes_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manager.lock");

        let lock = ManagerLock::acquire(&path, &fast_options())?;
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents, std::process::id().to_string());

        lock.release();
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_second_acquire_contends() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manager.lock");

        let _held = ManagerLock::acquire(&path, &fast_options())?;
        match ManagerLock::acquire(&path, &fast_options()) {
            Err(LockError::Contended { path: p }) => assert_eq!(p, path),
            other => panic!("Expected Contended, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn test_stale_lock_is_stolen() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manager.lock");
        std::fs::write(&path, "99999")?;

        // Anything older than 0ms is stale.
        let options = LockOptions {
            stale_ms: 0,
            ..fast_options()
        };
        std::thread::sleep(Duration::from_millis(5));
        let lock = ManagerLock::acquire(&path, &options)?;
        let contents = std::fs::read_to_string(&path)?;
        assert_eq!(contents, std::process::id().to_string());
        drop(lock);
        assert!(!path.exists());
        Ok(())
    }

    #[test]
    fn test_drop_releases() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("manager.lock");
        {
            let _lock = ManagerLock::acquire(&path, &fast_options())?;
            assert!(path.exists());
        }
        assert!(!path.exists());
        Ok(())
    }
}
