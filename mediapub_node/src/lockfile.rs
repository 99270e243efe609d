//! Advisory single-instance lock.
//!
//! The lock is a pid file under the base directory. It protects against a
//! second instance writing the same state and index, not against anything
//! else; staleness is resolved by probing whether the recorded pid is still
//! alive.

use std::io::Write;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".ipfs_publisher.lock";

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum LockError {
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning { pid: i32 },

    /// Exclusive create lost a race with another starting instance.
    #[error("lock file appeared while acquiring it (another instance may be starting)")]
    Contended,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Held pid-file lock. Released explicitly on shutdown; dropping it
/// releases as a fallback for error paths.
#[derive(Debug)]
pub struct Lockfile {
    path: PathBuf,
    held: bool,
}

impl Lockfile {
    pub fn new(base_dir: &Path) -> Self {
        Lockfile {
            path: base_dir.join(LOCK_FILE),
            held: false,
        }
    }

    /// Acquires the lock, clearing a stale file left by a dead process.
    pub fn acquire(&mut self) -> Result<(), LockError> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        if self.path.exists() {
            match self.read_pid() {
                Ok(pid) if process_running(pid) => {
                    return Err(LockError::AlreadyRunning { pid });
                }
                Ok(pid) => {
                    tracing::warn!(pid, "removing stale lock file from dead process");
                    std::fs::remove_file(&self.path)?;
                }
                Err(err) => {
                    tracing::warn!(%err, "removing unreadable lock file");
                    std::fs::remove_file(&self.path)?;
                }
            }
        }

        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(LockError::Contended);
            }
            Err(err) => return Err(err.into()),
        };

        writeln!(file, "{}", std::process::id())?;
        file.sync_all()?;
        self.held = true;
        Ok(())
    }

    /// Deletes the lock file.
    pub fn release(&mut self) -> std::io::Result<()> {
        if !self.held {
            return Ok(());
        }
        self.held = false;
        match std::fs::remove_file(&self.path) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    fn read_pid(&self) -> anyhow::Result<i32> {
        let text = std::fs::read_to_string(&self.path)?;
        Ok(text.trim().parse()?)
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        if self.held {
            let _ = self.release();
        }
    }
}

#[cfg(unix)]
fn process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // Signal 0 probes existence without delivering anything. EPERM means
    // the process exists but belongs to someone else.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_running(_pid: i32) -> bool {
    // Without a cheap probe, err on the side of refusing to start.
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_release() {
        let dir = tempfile::tempdir().unwrap();
        let mut lock = Lockfile::new(dir.path());

        lock.acquire().unwrap();
        let written = std::fs::read_to_string(dir.path().join(LOCK_FILE)).unwrap();
        assert_eq!(written.trim(), std::process::id().to_string());

        lock.release().unwrap();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn live_pid_blocks_acquisition() {
        let dir = tempfile::tempdir().unwrap();
        // Our own pid is definitely running.
        std::fs::write(dir.path().join(LOCK_FILE), format!("{}\n", std::process::id())).unwrap();

        let mut lock = Lockfile::new(dir.path());
        let err = lock.acquire().unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning { .. }));
    }

    #[test]
    fn stale_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        // Pids wrap far below this value, so nothing can be running here.
        std::fs::write(dir.path().join(LOCK_FILE), "1999999999\n").unwrap();

        let mut lock = Lockfile::new(dir.path());
        lock.acquire().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn malformed_lock_is_cleared() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(LOCK_FILE), "not a pid").unwrap();

        let mut lock = Lockfile::new(dir.path());
        lock.acquire().unwrap();
        lock.release().unwrap();
    }

    #[test]
    fn drop_releases_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut lock = Lockfile::new(dir.path());
            lock.acquire().unwrap();
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
    }
}
