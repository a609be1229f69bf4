//! Event domain, payload, and record types for the diagnostics journal.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use findex_db::{MigrationEvent, MigrationState, PoolEvent};
use findex_types::SchemaVersion;
use serde::Serialize;

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventDomain {
    /// Connection pool activity.
    #[serde(rename = "POOL")]
    Pool,
    /// Migration executor activity.
    #[serde(rename = "MIGRATION")]
    Migration,
}

impl EventDomain {
    /// Returns the canonical string label for this domain.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pool => "POOL",
            Self::Migration => "MIGRATION",
        }
    }
}

impl std::fmt::Display for EventDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn millis(d: Duration) -> f64 {
    d.as_nanos() as f64 / 1_000_000.0
}

/// Serialisable form of a pool or migration event.
///
/// Durations are rendered in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    ConnectionCreated { connection_id: u64 },
    ConnectionAcquired { connection_id: u64, wait_ms: f64 },
    ConnectionReleased { connection_id: u64 },
    ConnectionRecycled { connection_id: u64, reason: String },
    HealthCheckFailed { connection_id: u64, error: String },
    AcquireTimedOut { waited_ms: f64 },
    BusyRetry { attempt: u32, delay_ms: f64 },
    WriteContention { attempts: u32 },
    PoolShutDown,
    MigrationStateChanged { from: MigrationState, to: MigrationState },
    MigrationLockHeld { owner: String, stale: bool },
    BackupCreated { path: PathBuf },
    MigrationApplied { version: SchemaVersion, description: String, duration_ms: f64 },
    MigrationFailed { version: SchemaVersion, reason: String },
    BackupRestored { path: PathBuf },
}

impl From<&PoolEvent> for EventPayload {
    fn from(event: &PoolEvent) -> Self {
        match event {
            PoolEvent::Created { connection_id } => Self::ConnectionCreated {
                connection_id: *connection_id,
            },
            PoolEvent::Acquired {
                connection_id,
                wait,
            } => Self::ConnectionAcquired {
                connection_id: *connection_id,
                wait_ms: millis(*wait),
            },
            PoolEvent::Released { connection_id } => Self::ConnectionReleased {
                connection_id: *connection_id,
            },
            PoolEvent::Recycled {
                connection_id,
                reason,
            } => Self::ConnectionRecycled {
                connection_id: *connection_id,
                reason: reason.as_str().to_owned(),
            },
            PoolEvent::HealthCheckFailed {
                connection_id,
                error,
            } => Self::HealthCheckFailed {
                connection_id: *connection_id,
                error: error.clone(),
            },
            PoolEvent::AcquireTimedOut { waited } => Self::AcquireTimedOut {
                waited_ms: millis(*waited),
            },
            PoolEvent::BusyRetry { attempt, delay } => Self::BusyRetry {
                attempt: *attempt,
                delay_ms: millis(*delay),
            },
            PoolEvent::WriteContention { attempts } => Self::WriteContention {
                attempts: *attempts,
            },
            PoolEvent::ShutDown => Self::PoolShutDown,
        }
    }
}

impl From<&MigrationEvent> for EventPayload {
    fn from(event: &MigrationEvent) -> Self {
        match event {
            MigrationEvent::StateChanged { from, to } => Self::MigrationStateChanged {
                from: *from,
                to: *to,
            },
            MigrationEvent::LockHeld { owner, stale } => Self::MigrationLockHeld {
                owner: owner.clone(),
                stale: *stale,
            },
            MigrationEvent::BackupCreated { path } => Self::BackupCreated { path: path.clone() },
            MigrationEvent::StepApplied {
                version,
                description,
                duration,
            } => Self::MigrationApplied {
                version: *version,
                description: description.clone(),
                duration_ms: millis(*duration),
            },
            MigrationEvent::StepFailed { version, reason } => Self::MigrationFailed {
                version: *version,
                reason: reason.clone(),
            },
            MigrationEvent::BackupRestored { path } => Self::BackupRestored { path: path.clone() },
        }
    }
}

/// A journaled event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticEvent {
    /// Monotonic sequence number within the journal.
    pub seq: u64,
    /// When the event was recorded.
    pub recorded_at: DateTime<Utc>,
    pub domain: EventDomain,
    /// Stable event kind, as reported by the source event.
    pub kind: &'static str,
    pub payload: EventPayload,
}
