//! Storage core for findex.
//!
//! Provides a thread-safe SQLite connection pool (connections opened through
//! `r2d2_sqlite` in WAL mode), write transactions with nested savepoints, and
//! versioned schema migrations with backup, verification and rollback.
//!
//! # Design decisions
//!
//! - **One writer, many readers**: SQLite in WAL mode admits concurrent
//!   readers and a single writer. The pool does not serialize writers;
//!   SQLite's busy signal is retried with bounded backoff and surfaces as
//!   [`PoolError::WriteContention`] when it persists.
//! - **Explicit pool object**: a [`ConnectionPool`] is built, initialized and
//!   shut down by its owner and passed to whoever needs storage. There is no
//!   global instance.
//! - **Scoped access**: leased connections and transactions are guards that
//!   return their connection to the pool on drop, whatever the exit path.
//! - **Embedded migrations**: the application schema is compiled into the
//!   binary via `include_str!` so it cannot drift from the code using it.
//!
//! ```no_run
//! use findex_db::{builtin_registry, ConnectionPool, MigrationConfig, MigrationExecutor, PoolConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = ConnectionPool::open(PoolConfig::new("/var/lib/findex/index.db"))?;
//! let executor = MigrationExecutor::new(pool.clone(), builtin_registry()?, MigrationConfig::default());
//! executor.run()?;
//!
//! pool.transaction(|tx| {
//!     tx.execute("INSERT INTO search_history (query) VALUES (?1)", ["invoice"])?;
//!     Ok::<_, findex_db::PoolError>(())
//! })?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;
mod error;
pub mod migrate;
mod observer;
mod pool;
mod retry;
mod stats;
mod transaction;

pub use config::{serde_secs, PoolConfig};
pub use connection::{ConnectionInfo, ConnectionState, PooledConnection};
pub use error::{is_busy_error, PoolError};
pub use migrate::{
    builtin_registry, read_history, read_schema_version, HistoryEntry, LockInfo, LockState,
    Migration, MigrationConfig, MigrationError, MigrationEvent, MigrationExecutor,
    MigrationObserver, MigrationRegistry, MigrationReport, MigrationState, MigrationStatus, Verify,
};
pub use observer::{PoolEvent, PoolObserver, RecycleReason};
pub use pool::{ConnectionPool, ExclusiveAccess, HealthReport};
pub use retry::RetryPolicy;
pub use stats::{LatencySummary, PoolStatistics, LATENCY_WINDOW};
pub use transaction::{Savepoint, Transaction};
