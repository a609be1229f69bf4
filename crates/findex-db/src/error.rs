//! Error types for the connection pool and transaction layer.

use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors raised by the connection pool, transactions and savepoints.
///
/// Timeouts, health failures and write contention are transient and
/// reported as retryable by [`PoolError::is_retryable`]; the rest indicate
/// misconfiguration, misuse, or a pool that is no longer serving.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available before the timeout elapsed.
    #[error("timed out after {waited:?} waiting for a connection (max_connections = {max_connections})")]
    AcquisitionTimeout {
        /// How long the caller waited.
        waited: Duration,
        /// The pool capacity at the time.
        max_connections: usize,
    },

    /// A connection failed its health probe.
    #[error("connection {connection_id} failed its health probe: {source}")]
    Health {
        /// Identifier of the failing connection.
        connection_id: u64,
        /// The probe failure.
        source: rusqlite::Error,
    },

    /// The database stayed busy (another writer) through every retry.
    #[error("database writer busy after {attempts} attempts: {source}")]
    WriteContention {
        /// Number of attempts made.
        attempts: u32,
        /// The last busy error reported by SQLite.
        source: rusqlite::Error,
    },

    /// The pool could not be brought up.
    #[error("failed to initialize connection pool: {0}")]
    Initialization(String),

    /// The pool has been shut down; no further connections are handed out.
    #[error("connection pool has been shut down")]
    ShutDown,

    /// `acquire` was called before `initialize`.
    #[error("connection pool has not been initialized")]
    NotInitialized,

    /// A configuration value violated an invariant.
    #[error("invalid pool configuration: {0}")]
    InvalidConfig(String),

    /// A savepoint was released or rolled back out of LIFO order.
    #[error("savepoint '{found}' released out of order; innermost open savepoint is '{expected}'")]
    SavepointOrder {
        /// The innermost savepoint, which must be finished first.
        expected: String,
        /// The savepoint the caller tried to finish.
        found: String,
    },

    /// A savepoint name is not a plain SQL identifier.
    #[error("invalid savepoint name '{0}'")]
    InvalidSavepointName(String),

    /// Exclusive access to the pool could not be obtained or used.
    #[error("exclusive pool access failed: {0}")]
    ExclusiveAccess(String),

    /// An SQLite call failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl PoolError {
    /// Returns `true` for transient conditions a caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionTimeout { .. } | Self::Health { .. } | Self::WriteContention { .. }
        ) || self.is_busy()
    }

    /// Returns `true` when the underlying SQLite error is a busy or locked
    /// signal from the single-writer lock.
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Sqlite(e) => is_busy_error(e),
            _ => false,
        }
    }
}

/// Returns `true` if `err` is SQLite reporting `SQLITE_BUSY` or
/// `SQLITE_LOCKED`.
pub fn is_busy_error(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy() -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        )
    }

    #[test]
    fn busy_sqlite_errors_are_retryable() {
        let err = PoolError::from(busy());
        assert!(err.is_busy());
        assert!(err.is_retryable());
    }

    #[test]
    fn classification_matches_taxonomy() {
        let timeout = PoolError::AcquisitionTimeout {
            waited: Duration::from_millis(10),
            max_connections: 1,
        };
        assert!(timeout.is_retryable());

        let contention = PoolError::WriteContention {
            attempts: 3,
            source: busy(),
        };
        assert!(contention.is_retryable());
        assert!(!contention.is_busy());

        assert!(!PoolError::ShutDown.is_retryable());
        assert!(!PoolError::Initialization("nope".into()).is_retryable());
        assert!(!PoolError::from(rusqlite::Error::QueryReturnedNoRows).is_retryable());
    }
}
