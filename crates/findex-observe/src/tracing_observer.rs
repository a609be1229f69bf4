//! Observer that turns pool and migration events into `tracing` records.

use findex_db::{MigrationEvent, MigrationObserver, PoolEvent, PoolObserver};

/// Logs every event under the `findex::diagnostics` target.
///
/// Routine connection traffic is logged at `trace`, lifecycle milestones at
/// `info`, recoverable faults at `warn` and failed migration steps at
/// `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_pool_event(&self, event: &PoolEvent) {
        const TARGET: &str = "findex::diagnostics";
        match event {
            PoolEvent::Created { connection_id } => {
                tracing::debug!(target: TARGET, connection_id, "pool connection created");
            }
            PoolEvent::Acquired {
                connection_id,
                wait,
            } => {
                tracing::trace!(
                    target: TARGET,
                    connection_id,
                    wait_us = wait.as_micros() as u64,
                    "pool connection acquired"
                );
            }
            PoolEvent::Released { connection_id } => {
                tracing::trace!(target: TARGET, connection_id, "pool connection released");
            }
            PoolEvent::Recycled {
                connection_id,
                reason,
            } => {
                tracing::debug!(target: TARGET, connection_id, reason = reason.as_str(), "pool connection recycled");
            }
            PoolEvent::HealthCheckFailed {
                connection_id,
                error,
            } => {
                tracing::warn!(target: TARGET, connection_id, error = %error, "pool health check failed");
            }
            PoolEvent::AcquireTimedOut { waited } => {
                tracing::warn!(
                    target: TARGET,
                    waited_ms = waited.as_millis() as u64,
                    "pool acquisition timed out"
                );
            }
            PoolEvent::BusyRetry { attempt, delay } => {
                tracing::debug!(
                    target: TARGET,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "database busy, write retried"
                );
            }
            PoolEvent::WriteContention { attempts } => {
                tracing::warn!(target: TARGET, attempts, "write contention after retries");
            }
            PoolEvent::ShutDown => {
                tracing::info!(target: TARGET, "pool shut down");
            }
        }
    }
}

impl MigrationObserver for TracingObserver {
    fn on_migration_event(&self, event: &MigrationEvent) {
        const TARGET: &str = "findex::diagnostics";
        match event {
            MigrationEvent::StateChanged { from, to } => {
                tracing::debug!(target: TARGET, from = %from, to = %to, "migration state changed");
            }
            MigrationEvent::LockHeld { owner, stale } => {
                tracing::warn!(target: TARGET, owner = %owner, stale, "migration lock held elsewhere");
            }
            MigrationEvent::BackupCreated { path } => {
                tracing::info!(target: TARGET, path = %path.display(), "migration backup created");
            }
            MigrationEvent::StepApplied {
                version,
                description,
                duration,
            } => {
                tracing::info!(
                    target: TARGET,
                    version = %version,
                    description = %description,
                    duration_ms = duration.as_millis() as u64,
                    "migration applied"
                );
            }
            MigrationEvent::StepFailed { version, reason } => {
                tracing::error!(target: TARGET, version = %version, reason = %reason, "migration step failed");
            }
            MigrationEvent::BackupRestored { path } => {
                tracing::warn!(target: TARGET, path = %path.display(), "database restored from backup");
            }
        }
    }
}
