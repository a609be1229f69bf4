//! Pooled connection handles and their lifecycle metadata.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::pool::PoolShared;

/// Lifecycle state of a pooled connection.
///
/// Transitions are `Idle -> Active -> Idle` while the connection is in
/// rotation, and `any -> Unhealthy -> Closed` when it is retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Parked in the pool, ready to be leased.
    Idle,
    /// Leased to exactly one caller.
    Active,
    /// Failed a probe or a release-time rollback; will be closed.
    Unhealthy,
    /// Closed and removed from the pool.
    Closed,
}

impl ConnectionState {
    /// Returns the canonical string label for this state.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Unhealthy => "unhealthy",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time description of a pooled connection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    /// Pool-unique identifier.
    pub id: u64,
    /// Wall-clock time the connection was opened.
    pub created_at: DateTime<Utc>,
    /// Wall-clock time the connection was last leased or returned.
    pub last_used_at: DateTime<Utc>,
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Thread holding the lease, if any.
    #[serde(skip)]
    pub owner: Option<ThreadId>,
}

/// Bookkeeping kept beside every open connection.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionMeta {
    pub(crate) id: u64,
    pub(crate) created: Instant,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_used_at: DateTime<Utc>,
    pub(crate) last_probe: Instant,
    pub(crate) state: ConnectionState,
    pub(crate) owner: Option<ThreadId>,
    /// Makes the next health query fail.
    #[cfg(test)]
    pub(crate) fail_health_query: bool,
}

impl ConnectionMeta {
    pub(crate) fn new(id: u64) -> Self {
        let now = Utc::now();
        let created = Instant::now();
        Self {
            id,
            created,
            created_at: now,
            last_used_at: now,
            last_probe: created,
            state: ConnectionState::Idle,
            owner: None,
            #[cfg(test)]
            fail_health_query: false,
        }
    }

    pub(crate) fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub(crate) fn is_expired(&self, max_age: Duration) -> bool {
        self.age() >= max_age
    }

    pub(crate) fn probe_due(&self, interval: Duration) -> bool {
        !interval.is_zero() && self.last_probe.elapsed() >= interval
    }

    pub(crate) fn lease(&mut self) {
        self.state = ConnectionState::Active;
        self.owner = Some(thread::current().id());
        self.last_used_at = Utc::now();
    }

    pub(crate) fn park(&mut self) {
        self.state = ConnectionState::Idle;
        self.owner = None;
        self.last_used_at = Utc::now();
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            created_at: self.created_at,
            last_used_at: self.last_used_at,
            state: self.state,
            owner: self.owner,
        }
    }
}

/// An open SQLite connection together with its metadata.
pub(crate) struct Slot {
    pub(crate) conn: Connection,
    pub(crate) meta: ConnectionMeta,
}

impl Slot {
    /// Runs the trivial round-trip query used as a health probe.
    pub(crate) fn probe(&mut self) -> Result<(), rusqlite::Error> {
        #[cfg(test)]
        if self.meta.fail_health_query {
            return Err(rusqlite::Error::InvalidQuery);
        }
        let one: i64 = self.conn.query_row("SELECT 1", [], |row| row.get(0))?;
        if one != 1 {
            return Err(rusqlite::Error::InvalidQuery);
        }
        self.meta.last_probe = Instant::now();
        Ok(())
    }

    /// Closes the underlying connection, logging (not propagating) failures.
    pub(crate) fn close(mut self) {
        self.meta.state = ConnectionState::Closed;
        let id = self.meta.id;
        if let Err((_, e)) = self.conn.close() {
            tracing::warn!(connection_id = id, error = %e, "error while closing connection");
        } else {
            tracing::debug!(connection_id = id, "connection closed");
        }
    }
}

/// A connection leased from a [`ConnectionPool`](crate::ConnectionPool).
///
/// The handle dereferences to [`rusqlite::Connection`]. Dropping it returns
/// the connection to the pool on every exit path, including unwinding.
pub struct PooledConnection {
    slot: Option<Slot>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    pub(crate) fn new(slot: Slot, pool: Arc<PoolShared>) -> Self {
        Self {
            slot: Some(slot),
            pool,
        }
    }

    fn slot(&self) -> &Slot {
        match self.slot.as_ref() {
            Some(slot) => slot,
            None => unreachable!("connection slot is only taken on drop"),
        }
    }

    fn slot_mut(&mut self) -> &mut Slot {
        match self.slot.as_mut() {
            Some(slot) => slot,
            None => unreachable!("connection slot is only taken on drop"),
        }
    }

    /// Pool-unique identifier of this connection.
    pub fn id(&self) -> u64 {
        self.slot().meta.id
    }

    /// Snapshot of this connection's metadata.
    pub fn info(&self) -> ConnectionInfo {
        self.slot().meta.info()
    }

    /// Time since the connection was opened.
    pub fn age(&self) -> Duration {
        self.slot().meta.age()
    }

    /// Flags the connection so the pool closes it on release instead of
    /// parking it.
    pub fn mark_unhealthy(&mut self) {
        self.slot_mut().meta.state = ConnectionState::Unhealthy;
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.slot().conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.slot_mut().conn
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.slot.as_ref().map(|s| s.meta.id))
            .finish_non_exhaustive()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            PoolShared::check_in(&self.pool, slot);
        }
    }
}
