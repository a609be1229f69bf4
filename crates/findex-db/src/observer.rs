//! Passive observer hooks for pool activity.
//!
//! Observers are attached with
//! [`ConnectionPool::add_observer`](crate::ConnectionPool::add_observer) and
//! receive every [`PoolEvent`] after the pool's bookkeeping lock has been
//! released. They must not block for long: they run on the thread that
//! triggered the event.

use std::time::Duration;

/// Why a connection was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecycleReason {
    /// The connection outlived `connection_max_age`.
    Expired,
    /// The connection failed a probe or could not be reset on release.
    Unhealthy,
}

impl RecycleReason {
    /// Returns the canonical string label for this reason.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// Something that happened inside a connection pool.
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A new connection was opened.
    Created {
        /// Identifier of the new connection.
        connection_id: u64,
    },
    /// A connection was leased.
    Acquired {
        /// Identifier of the leased connection.
        connection_id: u64,
        /// Time the caller spent in `acquire`.
        wait: Duration,
    },
    /// A connection was returned and parked.
    Released {
        /// Identifier of the returned connection.
        connection_id: u64,
    },
    /// A connection was closed and removed from rotation.
    Recycled {
        /// Identifier of the retired connection.
        connection_id: u64,
        /// Why it was retired.
        reason: RecycleReason,
    },
    /// A health probe failed.
    HealthCheckFailed {
        /// Identifier of the failing connection.
        connection_id: u64,
        /// Rendered probe error.
        error: String,
    },
    /// A caller gave up waiting for a connection.
    AcquireTimedOut {
        /// How long the caller waited.
        waited: Duration,
    },
    /// A write hit the single-writer lock and will be retried.
    BusyRetry {
        /// The attempt about to be made (2 for the first retry).
        attempt: u32,
        /// Sleep before that attempt.
        delay: Duration,
    },
    /// A write gave up after exhausting its retries.
    WriteContention {
        /// Attempts made.
        attempts: u32,
    },
    /// The pool was shut down.
    ShutDown,
}

impl PoolEvent {
    /// Returns a stable, lowercase name for the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Created { .. } => "created",
            Self::Acquired { .. } => "acquired",
            Self::Released { .. } => "released",
            Self::Recycled { .. } => "recycled",
            Self::HealthCheckFailed { .. } => "health_check_failed",
            Self::AcquireTimedOut { .. } => "acquire_timed_out",
            Self::BusyRetry { .. } => "busy_retry",
            Self::WriteContention { .. } => "write_contention",
            Self::ShutDown => "shut_down",
        }
    }
}

/// Receives pool events.
pub trait PoolObserver: Send + Sync {
    /// Called once per event, outside the pool's internal lock.
    fn on_pool_event(&self, event: &PoolEvent);
}
