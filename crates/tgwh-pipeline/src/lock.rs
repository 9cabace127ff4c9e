//! Run-level mutual exclusion through a lock file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("run already in progress (run {holder}, started {since})")]
    Held { holder: String, since: String },
    #[error("lock file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    run_id: Uuid,
    pid: u32,
    acquired_at: DateTime<Utc>,
}

/// Held for the lifetime of a run; the file is removed on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    run_id: Uuid,
}

impl RunLock {
    /// Fails with [`LockError::Held`] while another run owns the lock, unless
    /// that lock is older than `stale_after`, in which case it is taken over.
    pub fn acquire(path: &Path, run_id: Uuid, stale_after: Duration) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        for attempt in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let info = LockInfo {
                        run_id,
                        pid: std::process::id(),
                        acquired_at: Utc::now(),
                    };
                    let body = serde_json::to_vec(&info)
                        .map_err(|err| io_err(std::io::Error::new(ErrorKind::InvalidData, err)))?;
                    file.write_all(&body).map_err(io_err)?;
                    debug!(path = %path.display(), %run_id, "run lock acquired");
                    return Ok(Self {
                        path: path.to_path_buf(),
                        run_id,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    let holder = read_holder(path);
                    let stale = holder
                        .as_ref()
                        .map(|h| is_stale(h.acquired_at, stale_after))
                        .unwrap_or(false);
                    if stale && attempt == 0 {
                        warn!(path = %path.display(), holder = ?holder, "taking over stale run lock");
                        match fs::remove_file(path) {
                            Ok(()) => continue,
                            Err(err) if err.kind() == ErrorKind::NotFound => continue,
                            Err(err) => return Err(io_err(err)),
                        }
                    }
                    return Err(match holder {
                        Some(h) => LockError::Held {
                            holder: h.run_id.to_string(),
                            since: h.acquired_at.to_rfc3339(),
                        },
                        None => LockError::Held {
                            holder: "unknown".to_string(),
                            since: "unknown".to_string(),
                        },
                    });
                }
                Err(err) => return Err(io_err(err)),
            }
        }
        Err(LockError::Held {
            holder: "unknown".to_string(),
            since: "unknown".to_string(),
        })
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        match read_holder(&self.path) {
            Some(holder) if holder.run_id != self.run_id => {
                warn!(path = %self.path.display(), "run lock was taken over; leaving it in place");
            }
            _ => {
                if let Err(err) = fs::remove_file(&self.path) {
                    warn!(path = %self.path.display(), error = %err, "failed to release run lock");
                }
            }
        }
    }
}

fn read_holder(path: &Path) -> Option<LockInfo> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn is_stale(acquired_at: DateTime<Utc>, stale_after: Duration) -> bool {
    let age = Utc::now().signed_duration_since(acquired_at);
    age.to_std().map(|age| age > stale_after).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn second_acquire_is_refused_until_release() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");

        let first = RunLock::acquire(&path, Uuid::new_v4(), HOUR).expect("first");
        let err = RunLock::acquire(&path, Uuid::new_v4(), HOUR).expect_err("held");
        assert!(err.to_string().starts_with("run already in progress"));
        assert!(err.to_string().contains(&first.run_id().to_string()));

        drop(first);
        assert!(!path.exists());
        RunLock::acquire(&path, Uuid::new_v4(), HOUR).expect("after release");
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        let old = LockInfo {
            run_id: Uuid::new_v4(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::hours(7),
        };
        fs::write(&path, serde_json::to_vec(&old).unwrap()).unwrap();

        let run_id = Uuid::new_v4();
        let lock = RunLock::acquire(&path, run_id, Duration::from_secs(6 * 3600)).expect("take over");
        assert_eq!(read_holder(lock.path()).map(|h| h.run_id), Some(run_id));
    }

    #[test]
    fn unreadable_lock_counts_as_held() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("run.lock");
        fs::write(&path, b"garbage").unwrap();

        assert!(matches!(
            RunLock::acquire(&path, Uuid::new_v4(), Duration::ZERO),
            Err(LockError::Held { .. })
        ));
    }
}
