//! findex application wiring: configuration, startup and operator commands.
//!
//! [`startup`] is the sequence the binary runs before anything touches the
//! index: open and initialize the pool, attach the diagnostics observers,
//! then bring the schema up to the newest built-in migration.

pub mod config;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use findex_db::{
    builtin_registry, ConnectionPool, LockInfo, MigrationError, MigrationExecutor,
    MigrationRegistry, MigrationReport, MigrationStatus, PoolError,
};
use findex_observe::{DiagnosticsReport, EventJournal, ObserveError, TracingObserver};
use thiserror::Error;

pub use config::{load_config, Config, ConfigError, LoggingConfig};

/// Extra attempts made when another run holds the migration lock.
pub const LOCK_RETRIES: u32 = 3;

/// Delay before the first lock retry; doubled for each following one.
pub const LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Errors that abort startup or an operator command.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("migration failed: {0}")]
    Migration(#[from] MigrationError),

    #[error("diagnostics error: {0}")]
    Observe(#[from] ObserveError),
}

/// A pool brought up to the current schema, with its diagnostics attached.
pub struct Runtime {
    pub pool: ConnectionPool,
    pub executor: MigrationExecutor,
    pub journal: Arc<EventJournal>,
    /// Outcome of the startup migration run.
    pub migration: MigrationReport,
}

impl Runtime {
    /// Snapshot of pool statistics, migration status and recent events.
    ///
    /// # Errors
    ///
    /// Returns `StartupError::Observe` if the migration status cannot be
    /// read.
    pub fn report(&self) -> Result<DiagnosticsReport, StartupError> {
        Ok(DiagnosticsReport::collect(
            &self.pool,
            &self.executor,
            &self.journal,
        )?)
    }

    /// Closes every pooled connection.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

/// Opens and initializes the pool described by `config`, with a journal and
/// the tracing observer attached.
///
/// # Errors
///
/// Returns `StartupError::Pool` for an invalid configuration or an
/// unreachable database.
pub fn open_pool(config: &Config) -> Result<(ConnectionPool, Arc<EventJournal>), StartupError> {
    let pool = ConnectionPool::new(config.database.clone())?;
    let journal = Arc::new(EventJournal::new());
    pool.add_observer(journal.clone());
    pool.add_observer(Arc::new(TracingObserver));
    pool.initialize()?;
    tracing::info!(
        path = %config.database.db_path.display(),
        max_connections = config.database.max_connections,
        "database pool ready"
    );
    Ok((pool, journal))
}

/// Builds an executor over the built-in migrations.
///
/// # Errors
///
/// Returns `StartupError::Migration` if the built-in registry is invalid.
pub fn executor_for(
    pool: &ConnectionPool,
    journal: &Arc<EventJournal>,
    config: &Config,
) -> Result<MigrationExecutor, StartupError> {
    Ok(new_executor(pool, journal, config, builtin_registry()?))
}

fn new_executor(
    pool: &ConnectionPool,
    journal: &Arc<EventJournal>,
    config: &Config,
    registry: MigrationRegistry,
) -> MigrationExecutor {
    let executor = MigrationExecutor::new(pool.clone(), registry, config.migrations.clone());
    executor.add_observer(journal.clone());
    executor.add_observer(Arc::new(TracingObserver));
    executor
}

/// Runs the startup sequence with the built-in migrations.
///
/// # Errors
///
/// See [`startup_with_registry`].
pub fn startup(config: &Config) -> Result<Runtime, StartupError> {
    startup_with_registry(config, builtin_registry()?)
}

/// Runs the startup sequence with `registry` in place of the built-in
/// migrations.
///
/// A held migration lock is retried [`LOCK_RETRIES`] times with doubling
/// delays. Any other migration failure shuts the pool down and aborts.
///
/// # Errors
///
/// Returns `StartupError::Pool` if the pool cannot be opened and
/// `StartupError::Migration` if the schema could not be brought up to date.
pub fn startup_with_registry(
    config: &Config,
    registry: MigrationRegistry,
) -> Result<Runtime, StartupError> {
    let (pool, journal) = open_pool(config)?;
    let executor = new_executor(&pool, &journal, config, registry);

    let migration = match run_with_lock_retry(&executor) {
        Ok(report) => report,
        Err(e) => {
            tracing::error!(error = %e, "startup migration failed, shutting down pool");
            pool.shutdown();
            return Err(e.into());
        }
    };

    if migration.is_noop() {
        tracing::info!(version = %migration.to, "schema up to date");
    } else {
        tracing::info!(
            from = %migration.from,
            to = %migration.to,
            applied = migration.applied.len(),
            "schema migrated"
        );
    }

    Ok(Runtime {
        pool,
        executor,
        journal,
        migration,
    })
}

fn run_with_lock_retry(executor: &MigrationExecutor) -> Result<MigrationReport, MigrationError> {
    let mut delay = LOCK_RETRY_DELAY;
    let mut retries = 0;
    loop {
        match executor.run() {
            Err(e) if e.is_retryable() && retries < LOCK_RETRIES => {
                retries += 1;
                tracing::warn!(
                    attempt = retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "migration lock held, retrying"
                );
                thread::sleep(delay);
                delay *= 2;
            }
            other => return other,
        }
    }
}

/// Reports migration status without migrating.
///
/// # Errors
///
/// Returns pool or migration errors.
pub fn status(config: &Config) -> Result<MigrationStatus, StartupError> {
    let (pool, journal) = open_pool(config)?;
    let result = executor_for(&pool, &journal, config).and_then(|executor| Ok(executor.status()?));
    pool.shutdown();
    result
}

/// Removes a stale or failed migration lock, or any lock with `force`.
///
/// Returns the removed lock, or `None` if no lock was present.
///
/// # Errors
///
/// Returns `StartupError::Migration` wrapping `LockHeld` when the lock is
/// live and `force` is not set.
pub fn recover_lock(config: &Config, force: bool) -> Result<Option<LockInfo>, StartupError> {
    let (pool, journal) = open_pool(config)?;
    let result = executor_for(&pool, &journal, config)
        .and_then(|executor| Ok(executor.recover_lock(force)?));
    pool.shutdown();
    result
}
