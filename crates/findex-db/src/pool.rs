//! Connection pool over a single-writer SQLite database.
//!
//! Connections are opened through `r2d2_sqlite`'s connection manager, which
//! applies the per-connection setup (WAL journal mode, foreign keys, busy
//! timeout). Bookkeeping (the free list, counters, waiters) lives behind one
//! mutex that is only ever held for pointer and counter updates: opening,
//! probing, rolling back and closing connections all happen after the lock
//! has been released.
//!
//! Writers are not serialized here. SQLite's own lock does that, and its
//! busy signal is surfaced as a retryable condition through
//! [`ConnectionPool::with_write_retry`].

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use r2d2::ManageConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OpenFlags;

use crate::config::PoolConfig;
use crate::connection::{ConnectionInfo, ConnectionMeta, ConnectionState, PooledConnection, Slot};
use crate::error::PoolError;
use crate::observer::{PoolEvent, PoolObserver, RecycleReason};
use crate::stats::{self, Counters, LatencyWindow, PoolStatistics, LATENCY_WINDOW};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    ShutDown,
}

/// State guarded by the pool's bookkeeping lock.
struct PoolInner {
    lifecycle: Lifecycle,
    idle: VecDeque<Slot>,
    /// Leased connections.
    active: usize,
    /// Reserved slots for connections being opened outside the lock.
    opening: usize,
    /// Idle connections temporarily taken out for a health probe.
    checking: usize,
    waiting: usize,
    exclusive: Option<ThreadId>,
    counters: Counters,
    latencies: LatencyWindow,
}

impl PoolInner {
    fn total(&self) -> usize {
        self.idle.len() + self.active + self.opening + self.checking
    }

    /// Whether another thread holds exclusive access.
    fn blocked_for(&self, me: ThreadId) -> bool {
        self.exclusive.is_some_and(|owner| owner != me)
    }

    fn lease_one(&mut self) {
        self.active += 1;
        self.counters.peak_active = self.counters.peak_active.max(self.active);
    }

    fn check_lifecycle(&self) -> Result<(), PoolError> {
        match self.lifecycle {
            Lifecycle::Created => Err(PoolError::NotInitialized),
            Lifecycle::ShutDown => Err(PoolError::ShutDown),
            Lifecycle::Running => Ok(()),
        }
    }
}

struct HealthMonitor {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

/// Shared pool state. Leased connections keep an `Arc` to it so they can
/// find their way home on drop.
pub(crate) struct PoolShared {
    config: PoolConfig,
    manager: SqliteConnectionManager,
    inner: Mutex<PoolInner>,
    changed: Condvar,
    next_id: AtomicU64,
    observers: RwLock<Vec<Arc<dyn PoolObserver>>>,
    monitor: Mutex<Option<HealthMonitor>>,
    init_lock: Mutex<()>,
}

/// Outcome of a [`ConnectionPool::health_check`] pass.
#[derive(Debug, Default)]
pub struct HealthReport {
    /// Idle connections examined.
    pub checked: usize,
    /// Connections that answered the probe and went back into rotation.
    pub healthy: usize,
    /// Connections closed during the pass (failed or expired).
    pub recycled: usize,
    /// One `PoolError::Health` per failed probe.
    pub failures: Vec<PoolError>,
}

enum Step {
    Reuse(Slot),
    Open,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_until<'a>(
        &self,
        guard: MutexGuard<'a, PoolInner>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, PoolInner>> {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (guard, _) = self
            .changed
            .wait_timeout(guard, deadline - now)
            .unwrap_or_else(PoisonError::into_inner);
        Some(guard)
    }

    fn emit(&self, event: PoolEvent) {
        let observers: Vec<Arc<dyn PoolObserver>> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in &observers {
            observer.on_pool_event(&event);
        }
    }

    fn open_slot(&self) -> Result<Slot, rusqlite::Error> {
        let conn = self.manager.connect()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(connection_id = id, "opened connection");
        Ok(Slot {
            conn,
            meta: ConnectionMeta::new(id),
        })
    }

    /// Returns a leased connection to the pool, or retires it.
    pub(crate) fn check_in(&self, mut slot: Slot) {
        let id = slot.meta.id;
        if !slot.conn.is_autocommit() {
            match slot.conn.execute_batch("ROLLBACK") {
                Ok(()) => {
                    tracing::debug!(connection_id = id, "rolled back open transaction on release");
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = id,
                        error = %e,
                        "failed to roll back open transaction on release"
                    );
                    slot.meta.state = ConnectionState::Unhealthy;
                }
            }
        }

        let reason = if slot.meta.state == ConnectionState::Unhealthy
            || self.manager.has_broken(&mut slot.conn)
        {
            Some(RecycleReason::Unhealthy)
        } else if slot.meta.is_expired(self.config.connection_max_age) {
            Some(RecycleReason::Expired)
        } else {
            None
        };

        let (retired, replenish) = {
            let mut inner = self.lock();
            inner.active = inner.active.saturating_sub(1);
            let shutting_down = inner.lifecycle == Lifecycle::ShutDown;
            let outcome = if shutting_down || reason.is_some() {
                inner.counters.closed += 1;
                if reason.is_some() {
                    inner.counters.recycled += 1;
                }
                let replenish = !shutting_down && inner.total() < self.config.min_connections;
                (Some(slot), replenish)
            } else {
                slot.meta.park();
                inner.idle.push_back(slot);
                (None, false)
            };
            self.changed.notify_all();
            outcome
        };

        match (retired, reason) {
            (Some(slot), Some(reason)) => {
                tracing::debug!(connection_id = id, reason = reason.as_str(), "recycling connection");
                slot.close();
                self.emit(PoolEvent::Recycled {
                    connection_id: id,
                    reason,
                });
            }
            (Some(slot), None) => slot.close(),
            (None, _) => self.emit(PoolEvent::Released { connection_id: id }),
        }

        if replenish {
            self.replenish();
        }
    }

    /// Opens connections until the pool holds `min_connections` again.
    /// Best effort: failures are logged and the next release tries again.
    fn replenish(&self) {
        let me = thread::current().id();
        loop {
            {
                let mut inner = self.lock();
                if inner.lifecycle != Lifecycle::Running
                    || inner.blocked_for(me)
                    || inner.total() >= self.config.min_connections
                    || inner.total() >= self.config.max_connections
                {
                    return;
                }
                inner.opening += 1;
            }

            match self.open_slot() {
                Ok(slot) => {
                    let id = slot.meta.id;
                    let leftover = {
                        let mut inner = self.lock();
                        inner.opening -= 1;
                        inner.counters.created += 1;
                        let leftover = if inner.lifecycle == Lifecycle::Running {
                            inner.idle.push_back(slot);
                            None
                        } else {
                            inner.counters.closed += 1;
                            Some(slot)
                        };
                        self.changed.notify_all();
                        leftover
                    };
                    self.emit(PoolEvent::Created { connection_id: id });
                    if let Some(slot) = leftover {
                        slot.close();
                        return;
                    }
                }
                Err(e) => {
                    {
                        let mut inner = self.lock();
                        inner.opening -= 1;
                        self.changed.notify_all();
                    }
                    tracing::warn!(error = %e, "failed to open replacement connection");
                    return;
                }
            }
        }
    }

    fn health_check(&self) -> HealthReport {
        let candidates: Vec<Slot> = {
            let mut inner = self.lock();
            if inner.lifecycle != Lifecycle::Running || inner.exclusive.is_some() {
                return HealthReport::default();
            }
            let taken: Vec<Slot> = inner.idle.drain(..).collect();
            inner.checking += taken.len();
            taken
        };

        let checked = candidates.len();
        let mut report = HealthReport {
            checked,
            ..HealthReport::default()
        };
        let mut healthy = Vec::with_capacity(checked);
        let mut events = Vec::new();

        for mut slot in candidates {
            let id = slot.meta.id;
            if slot.meta.is_expired(self.config.connection_max_age) {
                slot.close();
                report.recycled += 1;
                events.push(PoolEvent::Recycled {
                    connection_id: id,
                    reason: RecycleReason::Expired,
                });
                continue;
            }
            match slot.probe() {
                Ok(()) => healthy.push(slot),
                Err(e) => {
                    tracing::warn!(connection_id = id, error = %e, "connection failed health probe");
                    slot.meta.state = ConnectionState::Unhealthy;
                    slot.close();
                    report.recycled += 1;
                    events.push(PoolEvent::HealthCheckFailed {
                        connection_id: id,
                        error: e.to_string(),
                    });
                    events.push(PoolEvent::Recycled {
                        connection_id: id,
                        reason: RecycleReason::Unhealthy,
                    });
                    report.failures.push(PoolError::Health {
                        connection_id: id,
                        source: e,
                    });
                }
            }
        }
        report.healthy = healthy.len();

        let leftovers = {
            let mut inner = self.lock();
            inner.checking -= checked;
            inner.counters.closed += report.recycled as u64;
            inner.counters.recycled += report.recycled as u64;
            inner.counters.health_check_failures += report.failures.len() as u64;
            let leftovers = if inner.lifecycle == Lifecycle::Running {
                inner.idle.extend(healthy);
                Vec::new()
            } else {
                inner.counters.closed += healthy.len() as u64;
                healthy
            };
            self.changed.notify_all();
            leftovers
        };
        for slot in leftovers {
            slot.close();
        }
        for event in events {
            self.emit(event);
        }

        self.replenish();
        report
    }
}

/// A thread-safe pool of SQLite connections.
///
/// The pool is an explicitly constructed value: build it with
/// [`ConnectionPool::new`], bring it up with [`initialize`](Self::initialize)
/// and tear it down with [`shutdown`](Self::shutdown). Cloning is cheap and
/// every clone refers to the same pool.
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("db_path", &self.shared.config.db_path)
            .finish_non_exhaustive()
    }
}

/// Builds the connection manager with WAL mode, foreign keys and the busy
/// timeout applied to every new connection.
fn connection_manager(config: &PoolConfig) -> SqliteConnectionManager {
    let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_FULL_MUTEX;
    if config.db_path.to_string_lossy().starts_with("file:") {
        flags |= OpenFlags::SQLITE_OPEN_URI;
    }
    let busy_timeout_ms = u64::try_from(config.busy_timeout.as_millis()).unwrap_or(u64::MAX);

    SqliteConnectionManager::file(&config.db_path)
        .with_flags(flags)
        .with_init(move |conn| {
            // Set WAL mode and verify it was accepted. In-memory databases
            // report "memory" which is expected and acceptable.
            let journal_mode: String =
                conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
            if journal_mode != "wal" && journal_mode != "memory" {
                return Err(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_ERROR),
                    Some(format!(
                        "failed to set WAL journal mode, got: {}",
                        journal_mode
                    )),
                ));
            }
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = {};",
                busy_timeout_ms
            ))
        })
}

/// Checks that the database directory exists and is writable.
fn check_storage_location(config: &PoolConfig) -> Result<(), PoolError> {
    if config.is_in_memory() {
        return Ok(());
    }
    let dir = match config.db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let meta = fs::metadata(&dir).map_err(|e| {
        PoolError::Initialization(format!(
            "database directory {} is not accessible: {e}",
            dir.display()
        ))
    })?;
    if !meta.is_dir() {
        return Err(PoolError::Initialization(format!(
            "{} is not a directory",
            dir.display()
        )));
    }
    if meta.permissions().readonly() {
        return Err(PoolError::Initialization(format!(
            "database directory {} is not writable",
            dir.display()
        )));
    }
    if config.db_path.is_dir() {
        return Err(PoolError::Initialization(format!(
            "database path {} is a directory",
            config.db_path.display()
        )));
    }
    Ok(())
}

/// `started + timeout`, clamped to a year for timeouts too large to add.
fn deadline_after(started: Instant, timeout: Duration) -> Instant {
    const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);
    started
        .checked_add(timeout.min(FAR_FUTURE))
        .unwrap_or(started)
}

fn start_monitor(shared: &Arc<PoolShared>) -> std::io::Result<HealthMonitor> {
    let interval = shared.config.health_check_interval;
    let weak = Arc::downgrade(shared);
    let (stop, stopped) = mpsc::channel::<()>();
    let handle = thread::Builder::new()
        .name("findex-pool-health".into())
        .spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            let Some(shared) = weak.upgrade() else {
                break;
            };
            let report = shared.health_check();
            if report.failures.is_empty() {
                tracing::trace!(checked = report.checked, "periodic health check passed");
            } else {
                tracing::warn!(
                    checked = report.checked,
                    failed = report.failures.len(),
                    "periodic health check recycled connections"
                );
            }
        })?;
    Ok(HealthMonitor { stop, handle })
}

impl ConnectionPool {
    /// Creates a pool for `config` without opening any connection.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the configuration violates an
    /// invariant (see [`PoolConfig::validate`]).
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let manager = connection_manager(&config);
        Ok(Self {
            shared: Arc::new(PoolShared {
                manager,
                inner: Mutex::new(PoolInner {
                    lifecycle: Lifecycle::Created,
                    idle: VecDeque::with_capacity(config.max_connections),
                    active: 0,
                    opening: 0,
                    checking: 0,
                    waiting: 0,
                    exclusive: None,
                    counters: Counters::default(),
                    latencies: LatencyWindow::new(LATENCY_WINDOW),
                }),
                config,
                changed: Condvar::new(),
                next_id: AtomicU64::new(0),
                observers: RwLock::new(Vec::new()),
                monitor: Mutex::new(None),
                init_lock: Mutex::new(()),
            }),
        })
    }

    /// Creates and initializes a pool in one step.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::new`] and [`ConnectionPool::initialize`].
    pub fn open(config: PoolConfig) -> Result<Self, PoolError> {
        let pool = Self::new(config)?;
        pool.initialize()?;
        Ok(pool)
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Registers a passive observer for pool events.
    pub fn add_observer(&self, observer: Arc<dyn PoolObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Opens `min_connections` connections and starts the health monitor.
    ///
    /// With `min_connections = 0` a single connection is opened and closed
    /// again to prove the database is reachable. Calling `initialize` on a
    /// running pool is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Initialization` if the directory is missing or
    /// read-only, or a connection cannot be opened, and
    /// `PoolError::ShutDown` if the pool was already shut down.
    pub fn initialize(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        let _init = shared.init_lock.lock().unwrap_or_else(PoisonError::into_inner);
        match shared.lock().lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::ShutDown => return Err(PoolError::ShutDown),
            Lifecycle::Created => {}
        }

        check_storage_location(&shared.config)?;
        let db_path = shared.config.db_path.display().to_string();
        let open_err = |e: rusqlite::Error| {
            PoolError::Initialization(format!("cannot open database {db_path}: {e}"))
        };

        let mut slots = Vec::with_capacity(shared.config.min_connections);
        for _ in 0..shared.config.min_connections {
            match shared.open_slot() {
                Ok(slot) => slots.push(slot),
                Err(e) => {
                    slots.into_iter().for_each(Slot::close);
                    return Err(open_err(e));
                }
            }
        }
        let mut probed = 0;
        if slots.is_empty() {
            shared.open_slot().map_err(open_err)?.close();
            probed = 1;
        }

        if !shared.config.health_check_interval.is_zero() {
            match start_monitor(shared) {
                Ok(monitor) => {
                    *shared.monitor.lock().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
                }
                Err(e) => {
                    slots.into_iter().for_each(Slot::close);
                    return Err(PoolError::Initialization(format!(
                        "failed to start health monitor: {e}"
                    )));
                }
            }
        }

        let ids: Vec<u64> = slots.iter().map(|slot| slot.meta.id).collect();
        {
            let mut inner = shared.lock();
            inner.counters.created += (slots.len() + probed) as u64;
            inner.counters.closed += probed as u64;
            inner.idle.extend(slots);
            inner.lifecycle = Lifecycle::Running;
            shared.changed.notify_all();
        }
        for id in ids {
            shared.emit(PoolEvent::Created { connection_id: id });
        }

        tracing::info!(
            path = %db_path,
            min_connections = shared.config.min_connections,
            max_connections = shared.config.max_connections,
            "connection pool initialized"
        );
        Ok(())
    }

    /// Leases a connection, waiting up to `connection_timeout`.
    ///
    /// # Errors
    ///
    /// See [`ConnectionPool::acquire_timeout`].
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        self.acquire_timeout(self.shared.config.connection_timeout)
    }

    /// Leases a connection, waiting up to `timeout`.
    ///
    /// An idle connection is reused when one exists; otherwise a new one is
    /// opened while the pool is below `max_connections`; otherwise the
    /// calling thread blocks until a connection is released. Idle
    /// connections that outlived `connection_max_age` or fail an overdue
    /// probe are closed and skipped transparently.
    ///
    /// # Errors
    ///
    /// - `PoolError::AcquisitionTimeout` if nothing became available in time
    ///   (no side effects on the pool beyond the timeout counter).
    /// - `PoolError::ShutDown` if the pool is, or becomes, shut down.
    /// - `PoolError::NotInitialized` before [`initialize`](Self::initialize).
    /// - `PoolError::Sqlite` if opening a fresh connection fails.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let shared = &self.shared;
        let config = &shared.config;
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);
        let me = thread::current().id();

        loop {
            let step = {
                let mut inner = shared.lock();
                loop {
                    inner.check_lifecycle()?;
                    if !inner.blocked_for(me) {
                        if let Some(slot) = inner.idle.pop_front() {
                            inner.lease_one();
                            break Step::Reuse(slot);
                        }
                        if inner.total() < config.max_connections {
                            inner.opening += 1;
                            break Step::Open;
                        }
                    }
                    inner.waiting += 1;
                    match shared.wait_until(inner, deadline) {
                        Some(guard) => {
                            inner = guard;
                            inner.waiting -= 1;
                        }
                        None => {
                            let mut inner = shared.lock();
                            inner.waiting -= 1;
                            inner.counters.timeouts += 1;
                            drop(inner);
                            let waited = started.elapsed();
                            tracing::warn!(
                                waited_ms = waited.as_millis() as u64,
                                max_connections = config.max_connections,
                                "timed out waiting for a database connection"
                            );
                            shared.emit(PoolEvent::AcquireTimedOut { waited });
                            return Err(PoolError::AcquisitionTimeout {
                                waited,
                                max_connections: config.max_connections,
                            });
                        }
                    }
                }
            };

            match step {
                Step::Reuse(mut slot) => {
                    let id = slot.meta.id;
                    let retire = if slot.meta.is_expired(config.connection_max_age) {
                        Some((RecycleReason::Expired, None))
                    } else if slot.meta.probe_due(config.health_check_interval) {
                        slot.probe()
                            .err()
                            .map(|e| (RecycleReason::Unhealthy, Some(e)))
                    } else {
                        None
                    };

                    let Some((reason, probe_error)) = retire else {
                        return Ok(self.finish_lease(slot, started));
                    };

                    if let Some(e) = &probe_error {
                        tracing::warn!(connection_id = id, error = %e, "connection failed health probe");
                        slot.meta.state = ConnectionState::Unhealthy;
                    } else {
                        tracing::debug!(connection_id = id, "recycling expired connection");
                    }
                    slot.close();
                    {
                        let mut inner = shared.lock();
                        inner.active -= 1;
                        inner.counters.closed += 1;
                        inner.counters.recycled += 1;
                        if probe_error.is_some() {
                            inner.counters.health_check_failures += 1;
                        }
                        shared.changed.notify_all();
                    }
                    if let Some(e) = probe_error {
                        shared.emit(PoolEvent::HealthCheckFailed {
                            connection_id: id,
                            error: e.to_string(),
                        });
                    }
                    shared.emit(PoolEvent::Recycled {
                        connection_id: id,
                        reason,
                    });
                }
                Step::Open => match shared.open_slot() {
                    Ok(slot) => {
                        let id = slot.meta.id;
                        {
                            let mut inner = shared.lock();
                            inner.opening -= 1;
                            inner.counters.created += 1;
                            inner.lease_one();
                        }
                        shared.emit(PoolEvent::Created { connection_id: id });
                        return Ok(self.finish_lease(slot, started));
                    }
                    Err(e) => {
                        let mut inner = shared.lock();
                        inner.opening -= 1;
                        shared.changed.notify_all();
                        return Err(PoolError::Sqlite(e));
                    }
                },
            }
        }
    }

    fn finish_lease(&self, mut slot: Slot, started: Instant) -> PooledConnection {
        slot.meta.lease();
        let id = slot.meta.id;
        let wait = started.elapsed();
        {
            let mut inner = self.shared.lock();
            inner.counters.acquisitions += 1;
            inner.latencies.record(wait);
        }
        self.shared.emit(PoolEvent::Acquired {
            connection_id: id,
            wait,
        });
        PooledConnection::new(slot, Arc::clone(&self.shared))
    }

    /// Returns a connection to its pool.
    ///
    /// Equivalent to dropping the handle. Connections past
    /// `connection_max_age` or flagged unhealthy are closed instead of
    /// parked, and the pool refills itself up to `min_connections`.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Runs `f` with a leased connection and releases it afterwards, on
    /// success, on error, and on unwinding.
    ///
    /// # Errors
    ///
    /// Acquisition failures are converted into `E`; errors from `f` are
    /// returned unchanged.
    pub fn scoped_connection<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut PooledConnection) -> Result<T, E>,
        E: From<PoolError>,
    {
        let mut conn = self.acquire()?;
        f(&mut conn)
    }

    /// Runs `op`, retrying it with the pool's [`RetryPolicy`] while SQLite
    /// reports the database busy.
    ///
    /// [`RetryPolicy`]: crate::RetryPolicy
    ///
    /// # Errors
    ///
    /// Returns `PoolError::WriteContention` once every attempt was busy, or
    /// the first non-busy error from `op`.
    pub fn with_write_retry<T>(
        &self,
        op: impl FnMut() -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        let shared = &self.shared;
        let result = shared.config.retry.run(op, |attempt, delay| {
            shared.lock().counters.busy_retries += 1;
            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "database busy, retrying write"
            );
            shared.emit(PoolEvent::BusyRetry { attempt, delay });
        });

        if let Err(PoolError::WriteContention { attempts, .. }) = &result {
            shared.lock().counters.write_contention_failures += 1;
            tracing::warn!(attempts = *attempts, "write contention persisted through all retries");
            shared.emit(PoolEvent::WriteContention {
                attempts: *attempts,
            });
        }
        result
    }

    /// Probes every idle connection with a trivial round-trip query.
    ///
    /// Failing connections are marked unhealthy, closed and replaced;
    /// expired ones are recycled. The pass is skipped while the pool is not
    /// running or is held exclusively.
    pub fn health_check(&self) -> HealthReport {
        self.shared.health_check()
    }

    /// Returns a consistent snapshot of the pool's statistics.
    pub fn get_stats(&self) -> PoolStatistics {
        let (mut snapshot, samples) = {
            let inner = self.shared.lock();
            let c = &inner.counters;
            let snapshot = PoolStatistics {
                active: inner.active,
                idle: inner.idle.len(),
                total: inner.total(),
                waiting: inner.waiting,
                created: c.created,
                closed: c.closed,
                acquisitions: c.acquisitions,
                timeouts: c.timeouts,
                health_check_failures: c.health_check_failures,
                peak_active: c.peak_active,
                recycled: c.recycled,
                busy_retries: c.busy_retries,
                write_contention_failures: c.write_contention_failures,
                latency: Default::default(),
            };
            (snapshot, inner.latencies.samples())
        };
        snapshot.latency = stats::summarize(samples);
        snapshot
    }

    /// Metadata for the connections currently parked in the pool.
    pub fn idle_connections(&self) -> Vec<ConnectionInfo> {
        self.shared
            .lock()
            .idle
            .iter()
            .map(|slot| slot.meta.info())
            .collect()
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has run.
    pub fn is_shut_down(&self) -> bool {
        self.shared.lock().lifecycle == Lifecycle::ShutDown
    }

    /// Closes every idle connection, fails pending and future acquisitions
    /// with `PoolError::ShutDown`, and stops the health monitor.
    ///
    /// Leased connections are closed when they are released. Calling
    /// `shutdown` more than once is harmless.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        let drained: Vec<Slot> = {
            let mut inner = shared.lock();
            if inner.lifecycle == Lifecycle::ShutDown {
                return;
            }
            inner.lifecycle = Lifecycle::ShutDown;
            let drained: Vec<Slot> = inner.idle.drain(..).collect();
            inner.counters.closed += drained.len() as u64;
            shared.changed.notify_all();
            drained
        };
        let closed = drained.len();
        drained.into_iter().for_each(Slot::close);

        let monitor = shared
            .monitor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(HealthMonitor { stop, handle }) = monitor {
            drop(stop);
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                tracing::warn!("health monitor thread panicked");
            }
        }

        shared.emit(PoolEvent::ShutDown);
        tracing::info!(closed, "connection pool shut down");
    }

    /// Takes the pool exclusively for the calling thread.
    ///
    /// Other threads' acquisitions block (and eventually time out) while
    /// the returned guard is alive; the owning thread keeps leasing
    /// connections normally. The call waits until every outstanding lease
    /// has been returned, so the caller must not hold a connection itself.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ExclusiveAccess` if another holder or in-flight
    /// leases outlast `timeout`, or if this thread already holds the pool.
    pub fn exclusive(&self, timeout: Duration) -> Result<ExclusiveAccess<'_>, PoolError> {
        let shared = &self.shared;
        let me = thread::current().id();
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);

        let mut inner = shared.lock();
        loop {
            inner.check_lifecycle()?;
            match inner.exclusive {
                None => {
                    inner.exclusive = Some(me);
                    break;
                }
                Some(owner) if owner == me => {
                    return Err(PoolError::ExclusiveAccess(
                        "already held by the calling thread".into(),
                    ));
                }
                Some(_) => match shared.wait_until(inner, deadline) {
                    Some(guard) => inner = guard,
                    None => {
                        return Err(PoolError::ExclusiveAccess(format!(
                            "another thread held the pool for {:?}",
                            started.elapsed()
                        )));
                    }
                },
            }
        }

        while inner.active > 0 || inner.opening > 0 || inner.checking > 0 {
            let leased = inner.active;
            match shared.wait_until(inner, deadline) {
                Some(guard) => inner = guard,
                None => {
                    let mut inner = shared.lock();
                    inner.exclusive = None;
                    shared.changed.notify_all();
                    return Err(PoolError::ExclusiveAccess(format!(
                        "{leased} connection(s) still leased after {:?}",
                        started.elapsed()
                    )));
                }
            }
            if inner.lifecycle == Lifecycle::ShutDown {
                inner.exclusive = None;
                shared.changed.notify_all();
                return Err(PoolError::ShutDown);
            }
        }
        drop(inner);

        tracing::debug!("pool held exclusively");
        Ok(ExclusiveAccess { pool: self, owner: me })
    }
}

/// Exclusive hold on a [`ConnectionPool`], released on drop.
pub struct ExclusiveAccess<'a> {
    pool: &'a ConnectionPool,
    owner: ThreadId,
}

impl ExclusiveAccess<'_> {
    /// The pool being held.
    pub fn pool(&self) -> &ConnectionPool {
        self.pool
    }

    /// Closes every idle connection so the database file can be replaced
    /// on disk. Returns the number of connections closed.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ExclusiveAccess` while any connection is still
    /// leased, including by the owning thread.
    pub fn reset_connections(&self) -> Result<usize, PoolError> {
        let shared = &self.pool.shared;
        let drained: Vec<Slot> = {
            let mut inner = shared.lock();
            if inner.active > 0 || inner.opening > 0 || inner.checking > 0 {
                return Err(PoolError::ExclusiveAccess(format!(
                    "cannot reset connections while {} are leased",
                    inner.active + inner.opening + inner.checking
                )));
            }
            let drained: Vec<Slot> = inner.idle.drain(..).collect();
            inner.counters.closed += drained.len() as u64;
            drained
        };
        let closed = drained.len();
        drained.into_iter().for_each(Slot::close);
        tracing::debug!(closed, "closed all pooled connections");
        Ok(closed)
    }

    /// Refills the pool to `min_connections`.
    pub fn replenish(&self) {
        self.pool.shared.replenish();
    }
}

impl Drop for ExclusiveAccess<'_> {
    fn drop(&mut self) {
        let shared = &self.pool.shared;
        let mut inner = shared.lock();
        if inner.exclusive == Some(self.owner) {
            inner.exclusive = None;
        }
        shared.changed.notify_all();
        drop(inner);
        tracing::debug!("pool exclusive hold released");
    }
}
