//! Runs pending migrations against a pooled database.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use findex_types::SchemaVersion;
use serde::Serialize;

use super::lock::{self, LockInfo, MigrationLock};
use super::registry::{Migration, MigrationRegistry};
use super::{backup, metadata, MigrationConfig, MigrationError};
use crate::config::serde_secs;
use crate::error::PoolError;
use crate::pool::{ConnectionPool, ExclusiveAccess};

/// Where a migration run currently is.
///
/// Success: `Idle -> LockAcquired -> BackingUp -> Applying (-> Verifying)
/// -> Committed`. A failed step moves to `RollingBack` and then
/// `RolledBack`, or to `Failed` when the backup cannot be restored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationState {
    Idle,
    LockAcquired,
    BackingUp,
    Applying,
    Verifying,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl MigrationState {
    /// Lowercase name used in logs and status output.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::LockAcquired => "lock_acquired",
            Self::BackingUp => "backing_up",
            Self::Applying => "applying",
            Self::Verifying => "verifying",
            Self::Committed => "committed",
            Self::RollingBack => "rolling_back",
            Self::RolledBack => "rolled_back",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something that happened during a migration run.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    /// The executor moved between states.
    StateChanged {
        from: MigrationState,
        to: MigrationState,
    },
    /// The run could not start because another run holds the lock.
    LockHeld { owner: String, stale: bool },
    /// A pre-run backup was written.
    BackupCreated { path: PathBuf },
    /// One step committed.
    StepApplied {
        version: SchemaVersion,
        description: String,
        duration: Duration,
    },
    /// A step failed; the reason as rendered text.
    StepFailed {
        version: SchemaVersion,
        reason: String,
    },
    /// The database was put back from the backup.
    BackupRestored { path: PathBuf },
}

impl MigrationEvent {
    /// Returns a stable, lowercase name for the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::StateChanged { .. } => "state_changed",
            Self::LockHeld { .. } => "lock_held",
            Self::BackupCreated { .. } => "backup_created",
            Self::StepApplied { .. } => "step_applied",
            Self::StepFailed { .. } => "step_failed",
            Self::BackupRestored { .. } => "backup_restored",
        }
    }
}

/// Receives migration events on the thread running the migration.
pub trait MigrationObserver: Send + Sync {
    fn on_migration_event(&self, event: &MigrationEvent);
}

/// Outcome of a successful [`MigrationExecutor::run`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    /// Stored version when the run started.
    pub from: SchemaVersion,
    /// Stored version when the run finished.
    pub to: SchemaVersion,
    /// Versions applied by this run, in order.
    pub applied: Vec<SchemaVersion>,
    /// Backup kept for this run, if retention kept one.
    pub backup: Option<PathBuf>,
    /// Wall time of the run.
    #[serde(with = "serde_secs")]
    pub duration: Duration,
}

impl MigrationReport {
    /// Returns `true` when there was nothing to apply.
    pub fn is_noop(&self) -> bool {
        self.applied.is_empty()
    }
}

/// Where a database stands relative to the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub current: SchemaVersion,
    pub latest: Option<SchemaVersion>,
    pub pending: Vec<SchemaVersion>,
    /// Holder of the migration lock, if any.
    pub lock: Option<LockInfo>,
    /// Executor state in this process.
    pub state: MigrationState,
}

enum StepFailure {
    Apply(PoolError),
    Verification(String),
    Panicked(String),
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

impl fmt::Display for StepFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Apply(e) => write!(f, "{e}"),
            Self::Verification(reason) => write!(f, "verification failed: {reason}"),
            Self::Panicked(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Applies a [`MigrationRegistry`] to the database behind a pool.
///
/// `run` is safe to call at every startup: when nothing is pending it only
/// takes and releases the lock.
pub struct MigrationExecutor {
    pool: ConnectionPool,
    registry: MigrationRegistry,
    config: MigrationConfig,
    state: Mutex<MigrationState>,
    observers: RwLock<Vec<Arc<dyn MigrationObserver>>>,
}

impl fmt::Debug for MigrationExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MigrationExecutor")
            .field("db_path", &self.pool.config().db_path)
            .field("migrations", &self.registry.len())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl MigrationExecutor {
    /// Creates an executor in the `Idle` state.
    pub fn new(pool: ConnectionPool, registry: MigrationRegistry, config: MigrationConfig) -> Self {
        Self {
            pool,
            registry,
            config,
            state: Mutex::new(MigrationState::Idle),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// The pool migrations run against.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// The migrations this executor knows about.
    pub fn registry(&self) -> &MigrationRegistry {
        &self.registry
    }

    /// Lock, backup and timeout settings.
    pub fn config(&self) -> &MigrationConfig {
        &self.config
    }

    /// Location of this database's migration lock file.
    pub fn lock_path(&self) -> PathBuf {
        lock::lock_path(&self.pool.config().db_path)
    }

    /// Directory receiving backups.
    pub fn backup_dir(&self) -> PathBuf {
        self.config
            .backup_dir
            .clone()
            .unwrap_or_else(|| backup::default_backup_dir(&self.pool.config().db_path))
    }

    /// Current state of the most recent run.
    pub fn state(&self) -> MigrationState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an observer for migration lifecycle events.
    pub fn add_observer(&self, observer: Arc<dyn MigrationObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    fn emit(&self, event: MigrationEvent) {
        let observers: Vec<Arc<dyn MigrationObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer.on_migration_event(&event);
        }
    }

    fn transition(&self, to: MigrationState) {
        let from = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *state, to)
        };
        if from != to {
            tracing::debug!(from = %from, to = %to, "migration state changed");
            self.emit(MigrationEvent::StateChanged { from, to });
        }
    }

    fn read_version(&self) -> Result<SchemaVersion, MigrationError> {
        self.pool
            .scoped_connection(|conn| metadata::read_schema_version(conn))
    }

    /// Reports the stored version, pending migrations and lock holder
    /// without migrating.
    ///
    /// # Errors
    ///
    /// Returns pool, metadata or lock file errors.
    pub fn status(&self) -> Result<MigrationStatus, MigrationError> {
        let current = self.read_version()?;
        Ok(MigrationStatus {
            current,
            latest: self.registry.latest(),
            pending: self
                .registry
                .pending(current)
                .iter()
                .map(|m| m.version())
                .collect(),
            lock: lock::read(&self.lock_path())?,
            state: self.state(),
        })
    }

    /// Operator recovery for a lock left behind by a crashed or failed run.
    /// See [`lock::recover`](super::lock::recover) for the rules.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockHeld` for a live lock without `force`.
    pub fn recover_lock(&self, force: bool) -> Result<Option<LockInfo>, MigrationError> {
        let recovered = lock::recover(&self.lock_path(), self.config.lock_stale_after, force)?;
        if recovered.is_some() && self.state() == MigrationState::Failed {
            self.transition(MigrationState::Idle);
        }
        Ok(recovered)
    }

    /// Brings the database up to the newest registered version.
    ///
    /// # Errors
    ///
    /// - `MigrationError::LockHeld` if another run is in progress; nothing
    ///   was written.
    /// - `MigrationError::Apply` / `MigrationError::Verification` if a step
    ///   failed; the database was restored to its pre-run state.
    /// - `MigrationError::Unrecoverable` if the restore failed too; the lock
    ///   is left in place marked failed.
    /// - Pool, lock file and backup errors raised before any step ran.
    pub fn run(&self) -> Result<MigrationReport, MigrationError> {
        let started = Instant::now();
        let lock_path = self.lock_path();

        let lock = match MigrationLock::acquire(&lock_path, self.config.lock_stale_after) {
            Ok(lock) => lock,
            Err(e) => {
                if let MigrationError::LockHeld { owner, stale, .. } = &e {
                    tracing::warn!(owner = %owner, stale, path = %lock_path.display(), "migration lock is held by another run");
                    self.emit(MigrationEvent::LockHeld {
                        owner: owner.clone(),
                        stale: *stale,
                    });
                }
                return Err(e);
            }
        };
        self.transition(MigrationState::LockAcquired);

        let outcome = self.run_locked(started);

        match &outcome {
            Err(MigrationError::Unrecoverable { .. }) => {
                if let Err(e) = lock.mark_failed() {
                    tracing::error!(error = %e, "failed to mark migration lock as failed");
                }
            }
            _ => {
                if let Err(e) = lock.release() {
                    tracing::error!(error = %e, "failed to release migration lock");
                }
            }
        }

        if let Err(e) = &outcome {
            if !matches!(
                e,
                MigrationError::Apply { .. }
                    | MigrationError::Verification { .. }
                    | MigrationError::Panicked { .. }
                    | MigrationError::Unrecoverable { .. }
            ) {
                // Aborted before any step ran.
                self.transition(MigrationState::Idle);
            }
        }
        outcome
    }

    fn run_locked(&self, started: Instant) -> Result<MigrationReport, MigrationError> {
        let access = self.pool.exclusive(self.config.exclusive_timeout)?;
        let from = self.read_version()?;
        let pending = self.registry.pending(from);

        if pending.is_empty() {
            tracing::info!(version = %from, "schema is up to date");
            self.transition(MigrationState::Committed);
            return Ok(MigrationReport {
                from,
                to: from,
                applied: Vec::new(),
                backup: None,
                duration: started.elapsed(),
            });
        }

        tracing::info!(
            from = %from,
            to = %pending.last().map(|m| m.version()).unwrap_or(from),
            steps = pending.len(),
            "migrating schema"
        );

        self.transition(MigrationState::BackingUp);
        let backup_dir = self.backup_dir();
        let backup_path = backup::create(&access, &backup_dir, from)?;
        self.emit(MigrationEvent::BackupCreated {
            path: backup_path.clone(),
        });

        let mut applied = Vec::with_capacity(pending.len());
        for migration in pending {
            if let Err(failure) = self.apply_step(migration) {
                return Err(self.roll_back(&access, &backup_path, from, migration.version(), failure));
            }
            applied.push(migration.version());
        }

        let to = applied.last().copied().unwrap_or(from);
        self.transition(MigrationState::Committed);
        drop(access);

        let backup = self.retain(&backup_dir, backup_path);
        let duration = started.elapsed();
        tracing::info!(
            from = %from,
            to = %to,
            applied = applied.len(),
            duration_ms = duration.as_millis() as u64,
            "schema migration committed"
        );
        Ok(MigrationReport {
            from,
            to,
            applied,
            backup,
            duration,
        })
    }

    fn apply_step(&self, migration: &Migration) -> Result<(), StepFailure> {
        let version = migration.version();
        let step_started = Instant::now();
        self.transition(MigrationState::Applying);
        tracing::info!(version = %version, description = migration.description(), "applying migration");

        let tx = self.pool.begin().map_err(StepFailure::Apply)?;
        metadata::ensure_tables(&tx).map_err(|e| StepFailure::Apply(e.into()))?;
        // The step's transaction rolls back when `tx` drops on the way out.
        panic::catch_unwind(AssertUnwindSafe(|| migration.apply(&tx)))
            .map_err(|payload| StepFailure::Panicked(panic_message(payload.as_ref())))?
            .map_err(|e| StepFailure::Apply(e.into()))?;

        let check = panic::catch_unwind(AssertUnwindSafe(|| migration.verify(&tx)))
            .map_err(|payload| StepFailure::Panicked(panic_message(payload.as_ref())))?;
        if let Some(check) = check {
            self.transition(MigrationState::Verifying);
            match check {
                Ok(true) => {}
                Ok(false) => {
                    return Err(StepFailure::Verification(
                        "verification check returned false".into(),
                    ))
                }
                Err(e) => {
                    return Err(StepFailure::Verification(format!(
                        "verification check errored: {e}"
                    )))
                }
            }
        }

        metadata::record_step(&tx, version, migration.description())
            .map_err(|e| StepFailure::Apply(e.into()))?;
        tx.commit().map_err(StepFailure::Apply)?;

        let duration = step_started.elapsed();
        tracing::info!(version = %version, duration_ms = duration.as_millis() as u64, "migration applied");
        self.emit(MigrationEvent::StepApplied {
            version,
            description: migration.description().to_owned(),
            duration,
        });
        Ok(())
    }

    fn roll_back(
        &self,
        access: &ExclusiveAccess<'_>,
        backup_path: &Path,
        from: SchemaVersion,
        version: SchemaVersion,
        failure: StepFailure,
    ) -> MigrationError {
        self.transition(MigrationState::RollingBack);
        tracing::warn!(version = %version, error = %failure, "migration step failed, restoring backup");
        self.emit(MigrationEvent::StepFailed {
            version,
            reason: failure.to_string(),
        });

        let restored = backup::restore(access, backup_path)
            .map_err(|e| e.to_string())
            .and_then(|()| match self.read_version() {
                Ok(restored) if restored == from => Ok(()),
                Ok(restored) => Err(format!(
                    "restored database reports version {restored}, expected {from}"
                )),
                Err(e) => Err(e.to_string()),
            });

        match restored {
            Ok(()) => {
                self.transition(MigrationState::RolledBack);
                self.emit(MigrationEvent::BackupRestored {
                    path: backup_path.to_path_buf(),
                });
                let restored_from = backup_path.to_path_buf();
                match failure {
                    StepFailure::Apply(source) => MigrationError::Apply {
                        version,
                        source,
                        restored_from,
                    },
                    StepFailure::Verification(reason) => MigrationError::Verification {
                        version,
                        reason,
                        restored_from,
                    },
                    StepFailure::Panicked(message) => MigrationError::Panicked {
                        version,
                        message,
                        restored_from,
                    },
                }
            }
            Err(restore_err) => {
                self.transition(MigrationState::Failed);
                tracing::error!(
                    version = %version,
                    backup = %backup_path.display(),
                    error = %restore_err,
                    "backup restore failed; database state is uncertain"
                );
                MigrationError::Unrecoverable {
                    version,
                    reason: format!("{failure}; restore failed: {restore_err}"),
                    backup: Some(backup_path.to_path_buf()),
                }
            }
        }
    }

    /// Applies the retention policy to a successful run's backup. Returns
    /// the backup path when it is kept.
    fn retain(&self, dir: &Path, backup_path: PathBuf) -> Option<PathBuf> {
        if self.config.retain_backups == 0 {
            if let Err(e) = std::fs::remove_file(&backup_path) {
                tracing::warn!(path = %backup_path.display(), error = %e, "failed to discard backup");
            }
            return None;
        }
        if let Err(e) = backup::prune(dir, &self.pool.config().db_path, self.config.retain_backups) {
            tracing::warn!(error = %e, "failed to prune old backups");
        }
        backup_path.exists().then_some(backup_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use tempfile::TempDir;

    fn v(major: u32, minor: u32, patch: u32) -> SchemaVersion {
        SchemaVersion::new(major, minor, patch)
    }

    fn pool(dir: &TempDir) -> ConnectionPool {
        let config = PoolConfig {
            max_connections: 4,
            health_check_interval: Duration::ZERO,
            ..PoolConfig::new(dir.path().join("index.db"))
        };
        ConnectionPool::open(config).expect("pool should open")
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<MigrationEvent>>);

    impl MigrationObserver for Recorder {
        fn on_migration_event(&self, event: &MigrationEvent) {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event.clone());
        }
    }

    #[test]
    fn state_walks_the_success_path() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut registry = MigrationRegistry::new();
        registry
            .push(
                Migration::sql(v(1, 0, 0), "create t", "CREATE TABLE t (id INTEGER)")
                    .expect("valid")
                    .with_verify(|conn| {
                        conn.query_row(
                            "SELECT COUNT(*) FROM sqlite_master WHERE name = 't'",
                            [],
                            |row| row.get::<_, i64>(0),
                        )
                        .map(|n| n == 1)
                    }),
            )
            .expect("register");

        let executor = MigrationExecutor::new(pool(&dir), registry, MigrationConfig::default());
        let recorder = Arc::new(Recorder::default());
        executor.add_observer(recorder.clone());

        let report = executor.run().expect("run should succeed");
        assert_eq!(report.to, v(1, 0, 0));
        assert_eq!(report.backup, None, "default retention discards the backup");
        assert_eq!(executor.state(), MigrationState::Committed);

        let states: Vec<MigrationState> = recorder
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|event| match event {
                MigrationEvent::StateChanged { to, .. } => Some(*to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![
                MigrationState::LockAcquired,
                MigrationState::BackingUp,
                MigrationState::Applying,
                MigrationState::Verifying,
                MigrationState::Committed,
            ]
        );
        assert!(!executor.lock_path().exists());
        assert!(backup::list(&executor.backup_dir(), &executor.pool().config().db_path)
            .expect("list")
            .is_empty());
    }

    #[test]
    fn failed_verification_restores_backup() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut registry = MigrationRegistry::new();
        registry
            .push(Migration::sql(v(1, 0, 0), "base", "CREATE TABLE base (id INTEGER)").expect("valid"))
            .expect("register");
        registry
            .push(
                Migration::sql(v(1, 1, 0), "extra", "CREATE TABLE extra (id INTEGER)")
                    .expect("valid")
                    .with_verify(|_| Ok(false)),
            )
            .expect("register");

        let executor = MigrationExecutor::new(pool(&dir), registry, MigrationConfig::default());
        let err = executor.run().expect_err("verification should fail");
        match &err {
            MigrationError::Verification {
                version,
                restored_from,
                ..
            } => {
                assert_eq!(*version, v(1, 1, 0));
                assert!(restored_from.exists(), "failed runs keep their backup");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(executor.state(), MigrationState::RolledBack);

        let status = executor.status().expect("status");
        assert_eq!(status.current, SchemaVersion::ZERO, "1.0.0 is undone too");
        assert_eq!(status.pending, vec![v(1, 0, 0), v(1, 1, 0)]);
        assert!(status.lock.is_none());
    }

    #[test]
    fn panicking_step_restores_backup_and_releases_lock() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut registry = MigrationRegistry::new();
        registry
            .push(Migration::sql(v(1, 0, 0), "base", "CREATE TABLE base (id INTEGER)").expect("valid"))
            .expect("register");
        registry
            .push(
                Migration::function(v(1, 1, 0), "explodes", |_| panic!("bad transform"))
                    .expect("valid"),
            )
            .expect("register");

        let executor = MigrationExecutor::new(pool(&dir), registry, MigrationConfig::default());
        let recorder = Arc::new(Recorder::default());
        executor.add_observer(recorder.clone());

        let err = executor.run().expect_err("panicking step should fail the run");
        match &err {
            MigrationError::Panicked {
                version,
                message,
                restored_from,
            } => {
                assert_eq!(*version, v(1, 1, 0));
                assert_eq!(message, "bad transform");
                assert!(restored_from.exists());
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!err.is_retryable());
        assert_eq!(executor.state(), MigrationState::RolledBack);
        assert!(!executor.lock_path().exists());

        let status = executor.status().expect("status");
        assert_eq!(status.current, SchemaVersion::ZERO, "1.0.0 is undone too");
        assert!(recorder
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|event| matches!(event, MigrationEvent::BackupRestored { .. })));
        assert_eq!(executor.pool().get_stats().active, 0);
    }

    #[test]
    fn retention_keeps_configured_backups() {
        let dir = TempDir::new().expect("should create temp dir");
        let mut registry = MigrationRegistry::new();
        registry
            .push(Migration::sql(v(1, 0, 0), "base", "CREATE TABLE base (id INTEGER)").expect("valid"))
            .expect("register");
        let config = MigrationConfig {
            retain_backups: 1,
            backup_dir: Some(dir.path().join("backups")),
            ..MigrationConfig::default()
        };
        let executor = MigrationExecutor::new(pool(&dir), registry, config);

        let report = executor.run().expect("run should succeed");
        let kept = report.backup.expect("backup retained");
        assert!(kept.starts_with(dir.path().join("backups")));
        assert!(kept.exists());
    }
}
