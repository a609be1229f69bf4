//! Sidecar lock file that keeps migration runs mutually exclusive.
//!
//! The lock lives next to the database as `<db>.migrate.lock` and is created
//! with create-new semantics, so exactly one process or thread can hold it.
//! Its JSON body records who holds it and since when. A lock is never
//! broken automatically: a stale or failed lock is only removed through
//! [`recover`], the operator path.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MigrationError;

/// Whether the holder is still working or gave up without restoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// A run is in progress (or crashed while in progress).
    Running,
    /// A run failed and could not restore its backup.
    Failed,
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Failed => "failed",
        })
    }
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Identifier of the run holding the lock.
    pub owner: String,
    /// Process id of the holder.
    pub pid: u32,
    /// When the lock was taken.
    pub acquired_at: DateTime<Utc>,
    /// Holder state.
    pub state: LockState,
}

impl LockInfo {
    /// Returns `true` when the lock is older than `stale_after`.
    pub fn is_stale(&self, stale_after: Duration, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(stale_after) {
            Ok(threshold) => now.signed_duration_since(self.acquired_at) > threshold,
            Err(_) => false,
        }
    }
}

/// Location of the lock file for the database at `db_path`.
pub fn lock_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(".migrate.lock");
    PathBuf::from(name)
}

fn lock_io(path: &Path) -> impl FnOnce(io::Error) -> MigrationError + '_ {
    move |source| MigrationError::Lock {
        path: path.to_path_buf(),
        source,
    }
}

fn write_info(file: &mut File, info: &LockInfo) -> io::Result<()> {
    let body = serde_json::to_vec_pretty(info).map_err(io::Error::other)?;
    file.write_all(&body)?;
    file.sync_all()
}

/// Reads the current lock, if any.
///
/// # Errors
///
/// Returns `MigrationError::Lock` if the file exists but cannot be read or
/// does not contain a lock record.
pub fn read(path: &Path) -> Result<Option<LockInfo>, MigrationError> {
    let body = match fs::read(path) {
        Ok(body) => body,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(lock_io(path)(e)),
    };
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| lock_io(path)(io::Error::new(io::ErrorKind::InvalidData, e)))
}

/// A held migration lock. Release it with [`MigrationLock::release`]; a
/// lock that is merely dropped stays on disk, exactly as if the process had
/// crashed.
#[derive(Debug)]
pub struct MigrationLock {
    path: PathBuf,
    info: LockInfo,
}

impl MigrationLock {
    /// Takes the lock at `path`.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockHeld` if the file already exists (with
    /// `stale` set when it is older than `stale_after`), or
    /// `MigrationError::Lock` on I/O failure.
    pub fn acquire(path: &Path, stale_after: Duration) -> Result<Self, MigrationError> {
        let info = LockInfo {
            owner: Uuid::new_v4().to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
            state: LockState::Running,
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(held_error(path, stale_after));
            }
            Err(e) => return Err(lock_io(path)(e)),
        };

        if let Err(e) = write_info(&mut file, &info) {
            drop(file);
            if let Err(remove_err) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %remove_err, "failed to remove half-written migration lock");
            }
            return Err(lock_io(path)(e));
        }

        tracing::debug!(path = %path.display(), owner = %info.owner, "migration lock acquired");
        Ok(Self {
            path: path.to_path_buf(),
            info,
        })
    }

    /// The record written to the lock file.
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Removes the lock file.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the file cannot be removed.
    pub fn release(self) -> Result<(), MigrationError> {
        fs::remove_file(&self.path).map_err(lock_io(&self.path))?;
        tracing::debug!(path = %self.path.display(), owner = %self.info.owner, "migration lock released");
        Ok(())
    }

    /// Leaves the lock in place, rewritten with state `failed`, so later
    /// runs refuse to start until an operator recovers it.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Lock` if the file cannot be rewritten. The
    /// lock still stays in place.
    pub fn mark_failed(mut self) -> Result<(), MigrationError> {
        self.info.state = LockState::Failed;
        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(lock_io(&self.path))?;
        write_info(&mut file, &self.info).map_err(lock_io(&self.path))?;
        tracing::error!(path = %self.path.display(), owner = %self.info.owner, "migration lock left in failed state");
        Ok(())
    }
}

fn held_error(path: &Path, stale_after: Duration) -> MigrationError {
    let now = Utc::now();
    match read(path) {
        Ok(Some(info)) => MigrationError::LockHeld {
            path: path.to_path_buf(),
            stale: info.is_stale(stale_after, now),
            owner: info.owner,
            pid: info.pid,
            acquired_at: info.acquired_at,
            state: info.state,
        },
        // Unreadable or mid-write: fall back to the file's age.
        Ok(None) | Err(_) => {
            let acquired_at = fs::metadata(path)
                .and_then(|meta| meta.modified())
                .map(DateTime::<Utc>::from)
                .unwrap_or(now);
            let probe = LockInfo {
                owner: "unknown".into(),
                pid: 0,
                acquired_at,
                state: LockState::Running,
            };
            MigrationError::LockHeld {
                path: path.to_path_buf(),
                stale: probe.is_stale(stale_after, now),
                owner: probe.owner,
                pid: probe.pid,
                acquired_at,
                state: probe.state,
            }
        }
    }
}

/// Operator recovery: removes a stale or failed lock, or any lock when
/// `force` is set. Returns the removed record, or `None` when no lock was
/// present.
///
/// # Errors
///
/// Returns `MigrationError::LockHeld` when the lock belongs to a live,
/// non-stale run and `force` is not set, and `MigrationError::Lock` on I/O
/// failure. An unreadable lock file is removed only with `force`.
pub fn recover(
    path: &Path,
    stale_after: Duration,
    force: bool,
) -> Result<Option<LockInfo>, MigrationError> {
    let info = match read(path) {
        Ok(Some(info)) => info,
        Ok(None) => return Ok(None),
        Err(e) if !force => return Err(e),
        Err(_) => {
            fs::remove_file(path).map_err(lock_io(path))?;
            tracing::warn!(path = %path.display(), "removed unreadable migration lock");
            return Ok(None);
        }
    };

    let stale = info.is_stale(stale_after, Utc::now());
    if !force && !stale && info.state == LockState::Running {
        return Err(MigrationError::LockHeld {
            path: path.to_path_buf(),
            owner: info.owner,
            pid: info.pid,
            acquired_at: info.acquired_at,
            state: info.state,
            stale,
        });
    }

    fs::remove_file(path).map_err(lock_io(path))?;
    tracing::warn!(
        path = %path.display(),
        owner = %info.owner,
        state = %info.state,
        stale,
        force,
        "migration lock recovered"
    );
    Ok(Some(info))
}
