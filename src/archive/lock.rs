//! Repository lock
//!
//! Backups and merges take an exclusive lock file before mutating a
//! repository. The file is created with `create_new`, so a second writer
//! fails immediately with `RepositoryBusy` instead of waiting. The lock is
//! released when the guard is dropped.
//!
//! The file records the holder's operation and pid. A lock whose process no
//! longer exists was left by a crash and is taken over, so an interrupted
//! backup can be resumed. A lock file that cannot be parsed is only taken
//! over once it is older than [`UNREADABLE_GRACE`].

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::file_io::io_error;
use crate::error::{BackupError, BackupResult};

/// Age after which an unreadable lock file counts as abandoned
pub const UNREADABLE_GRACE: Duration = Duration::from_secs(60);

/// Contents of the lock file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockHolder {
    pub operation: String,
    pub pid: u32,
    pub since: DateTime<Utc>,
}

impl LockHolder {
    fn current(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            pid: std::process::id(),
            since: Utc::now(),
        }
    }
}

impl fmt::Display for LockHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} pid {} since {}",
            self.operation,
            self.pid,
            self.since.to_rfc3339()
        )
    }
}

/// Held while a repository is being mutated
#[derive(Debug)]
pub struct RepositoryLock {
    path: PathBuf,
}

impl RepositoryLock {
    /// Take the lock for `repository`
    pub fn acquire(path: &Path, repository: &str, operation: &str) -> BackupResult<Self> {
        for _ in 0..2 {
            let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(file) => file,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    take_over_if_abandoned(path, repository)?;
                    continue;
                }
                Err(e) => return Err(io_error(path, "create lock file", e)),
            };

            let holder = serde_json::to_vec(&LockHolder::current(operation))?;
            file.write_all(&holder)
                .map_err(|e| io_error(path, "write lock file", e))?;
            file.sync_all()
                .map_err(|e| io_error(path, "sync lock file", e))?;

            debug!(repository, operation, "repository locked");
            return Ok(Self {
                path: path.to_path_buf(),
            });
        }

        Err(BackupError::RepositoryBusy(format!(
            "{} (lock taken by another process)",
            repository
        )))
    }
}

impl Drop for RepositoryLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to release repository lock");
        }
    }
}

/// Who holds the lock at `path`, if the file is readable
pub fn lock_holder(path: &Path) -> Option<LockHolder> {
    let contents = fs::read(path).ok()?;
    serde_json::from_slice(&contents).ok()
}

/// Remove the lock file at `path` if its holder is gone; busy otherwise
fn take_over_if_abandoned(path: &Path, repository: &str) -> BackupResult<()> {
    match lock_holder(path) {
        Some(holder) if process_alive(holder.pid) => Err(BackupError::RepositoryBusy(format!(
            "{} ({})",
            repository, holder
        ))),
        Some(holder) => {
            warn!(
                repository,
                pid = holder.pid,
                operation = %holder.operation,
                "taking over lock of a process that no longer exists"
            );
            remove_lock_file(path)
        }
        None if unreadable_expired(path) => {
            warn!(repository, path = %path.display(), "taking over unreadable lock file");
            remove_lock_file(path)
        }
        None => Err(BackupError::RepositoryBusy(format!(
            "{} (lock file is being written)",
            repository
        ))),
    }
}

fn remove_lock_file(path: &Path) -> BackupResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error(path, "remove stale lock file", e)),
    }
}

fn unreadable_expired(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age >= UNREADABLE_GRACE)
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    // Signal 0 only checks existence; EPERM still means the process exists
    !matches!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH))
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_writer_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".lock");

        let lock = RepositoryLock::acquire(&path, "repo", "backup").unwrap();
        assert_eq!(lock_holder(&path).unwrap().pid, std::process::id());

        let err = RepositoryLock::acquire(&path, "repo", "merge").unwrap_err();
        assert!(matches!(err, BackupError::RepositoryBusy(_)));
        assert!(err.to_string().contains("backup pid"));

        drop(lock);
        assert!(!path.exists());
        RepositoryLock::acquire(&path, "repo", "merge").unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_lock_of_exited_process_is_taken_over() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".lock");

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let holder = LockHolder {
            operation: "backup".into(),
            pid,
            since: Utc::now(),
        };
        fs::write(&path, serde_json::to_vec(&holder).unwrap()).unwrap();

        let lock = RepositoryLock::acquire(&path, "repo", "merge").unwrap();
        let holder = lock_holder(&path).unwrap();
        assert_eq!(holder.operation, "merge");
        assert_eq!(holder.pid, std::process::id());
        drop(lock);
    }

    #[test]
    fn test_fresh_unreadable_lock_is_busy() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".lock");
        fs::write(&path, b"").unwrap();

        let err = RepositoryLock::acquire(&path, "repo", "backup").unwrap_err();
        assert!(matches!(err, BackupError::RepositoryBusy(_)));
        assert!(path.exists());
    }
}
