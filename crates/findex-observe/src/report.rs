//! Point-in-time diagnostics report.

use chrono::{DateTime, Utc};
use findex_db::{ConnectionInfo, ConnectionPool, MigrationExecutor, MigrationStatus, PoolStatistics};
use serde::Serialize;

use crate::error::ObserveError;
use crate::event::DiagnosticEvent;
use crate::journal::EventJournal;

/// Everything an operator needs to judge the storage core's health.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub database: String,
    pub pool: PoolStatistics,
    pub idle_connections: Vec<ConnectionInfo>,
    pub migration: MigrationStatus,
    pub recent_events: Vec<DiagnosticEvent>,
}

impl DiagnosticsReport {
    /// Gathers pool statistics, migration status and the journal contents.
    ///
    /// # Errors
    ///
    /// Returns `ObserveError::Migration` if the migration status cannot be
    /// read.
    pub fn collect(
        pool: &ConnectionPool,
        executor: &MigrationExecutor,
        journal: &EventJournal,
    ) -> Result<Self, ObserveError> {
        Ok(Self {
            generated_at: Utc::now(),
            database: pool.config().db_path.display().to_string(),
            pool: pool.get_stats(),
            idle_connections: pool.idle_connections(),
            migration: executor.status()?,
            recent_events: journal.snapshot(),
        })
    }

    /// Renders the report as indented JSON.
    ///
    /// # Errors
    ///
    /// Returns `ObserveError::Serialization` if serialisation fails.
    pub fn to_json_pretty(&self) -> Result<String, ObserveError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
