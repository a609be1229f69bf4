use std::io;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use findex_types::SchemaVersion;
use thiserror::Error;

use super::lock::LockState;
use crate::error::PoolError;

/// Errors raised while registering or running schema migrations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// A migration record was rejected at registration time. This is a
    /// programming error.
    #[error("invalid migration registration: {0}")]
    Registration(String),

    /// Another run holds the migration lock. Back off and retry later.
    #[error(
        "migration lock {} is held by {owner} (pid {pid}, {state}) since {acquired_at}, stale: {stale}",
        .path.display()
    )]
    LockHeld {
        /// Lock file location.
        path: PathBuf,
        /// Run identifier of the holder.
        owner: String,
        /// Process id of the holder.
        pid: u32,
        /// When the holder took the lock.
        acquired_at: DateTime<Utc>,
        /// Running or left behind by an unrecoverable run.
        state: LockState,
        /// Older than the configured staleness threshold.
        stale: bool,
    },

    /// A forward transformation failed. The run was rolled back to the
    /// pre-run backup.
    #[error("migration {version} failed: {source}; database restored from {}", .restored_from.display())]
    Apply {
        /// Version whose step failed.
        version: SchemaVersion,
        /// The failure.
        source: PoolError,
        /// Backup the database was restored from.
        restored_from: PathBuf,
    },

    /// A verification check rejected the migrated schema. The run was
    /// rolled back to the pre-run backup.
    #[error("migration {version} failed verification: {reason}; database restored from {}", .restored_from.display())]
    Verification {
        /// Version whose check failed.
        version: SchemaVersion,
        /// What the check reported.
        reason: String,
        /// Backup the database was restored from.
        restored_from: PathBuf,
    },

    /// A step's transformation or check panicked. The run was rolled back
    /// to the pre-run backup.
    #[error("migration {version} panicked: {message}; database restored from {}", .restored_from.display())]
    Panicked {
        /// Version whose step panicked.
        version: SchemaVersion,
        /// The panic payload, when it was a string.
        message: String,
        /// Backup the database was restored from.
        restored_from: PathBuf,
    },

    /// A step failed and the backup could not be restored. The database
    /// state is uncertain; the lock stays in place until an operator
    /// recovers it.
    #[error("migration {version} failed and the database could not be restored: {reason}")]
    Unrecoverable {
        /// Version whose step failed.
        version: SchemaVersion,
        /// The step failure and the restore failure.
        reason: String,
        /// Backup that should have been restored, if one was taken.
        backup: Option<PathBuf>,
    },

    /// The pool failed outside of a migration step.
    #[error("connection pool error during migration: {0}")]
    Pool(#[from] PoolError),

    /// The lock file could not be read or written.
    #[error("migration lock {}: {source}", .path.display())]
    Lock {
        /// Lock file location.
        path: PathBuf,
        /// The I/O failure.
        source: io::Error,
    },

    /// A backup could not be created, restored or pruned.
    #[error("migration backup {}: {source}", .path.display())]
    Backup {
        /// Backup or database file involved.
        path: PathBuf,
        /// The I/O failure.
        source: io::Error,
    },

    /// The metadata tables could not be read.
    #[error("failed to read migration state: {0}")]
    State(#[source] rusqlite::Error),
}

impl MigrationError {
    /// Returns `true` only for a held lock: the caller should wait and try
    /// again. Every other migration failure must stop startup.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockHeld { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_held_is_retryable() {
        let held = MigrationError::LockHeld {
            path: PathBuf::from("db.sqlite.migrate.lock"),
            owner: "run".into(),
            pid: 1,
            acquired_at: Utc::now(),
            state: LockState::Running,
            stale: true,
        };
        assert!(held.is_retryable());
        assert!(held.to_string().contains("stale: true"));

        let unrecoverable = MigrationError::Unrecoverable {
            version: SchemaVersion::new(1, 1, 0),
            reason: "copy failed".into(),
            backup: None,
        };
        assert!(!unrecoverable.is_retryable());
        assert!(!MigrationError::Registration("dup".into()).is_retryable());
    }
}
