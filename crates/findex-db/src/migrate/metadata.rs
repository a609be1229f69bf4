//! Schema version and migration history stored inside the database.

use chrono::{DateTime, Utc};
use findex_types::SchemaVersion;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::MigrationError;

/// Key/value table holding `schema_version`.
pub const META_TABLE: &str = "_findex_meta";

/// Append-only log of applied migrations.
pub const HISTORY_TABLE: &str = "_findex_migrations";

const SCHEMA_VERSION_KEY: &str = "schema_version";

/// One applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryEntry {
    /// Version the migration moved the schema to.
    pub version: SchemaVersion,
    /// Description registered with the migration.
    pub description: String,
    /// When the migration committed.
    pub applied_at: DateTime<Utc>,
}

pub(crate) fn ensure_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "CREATE TABLE IF NOT EXISTS {META_TABLE} (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
            version TEXT PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );"
    ))
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

fn parse_version(column: usize, raw: &str) -> rusqlite::Result<SchemaVersion> {
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

/// Reads the stored schema version. A database that was never migrated is
/// at `0.0.0`.
///
/// # Errors
///
/// Returns `MigrationError::State` if the metadata table cannot be queried
/// or holds a malformed version.
pub fn read_schema_version(conn: &Connection) -> Result<SchemaVersion, MigrationError> {
    let read = || -> rusqlite::Result<SchemaVersion> {
        if !table_exists(conn, META_TABLE)? {
            return Ok(SchemaVersion::ZERO);
        }
        let raw: Option<String> = conn
            .query_row(
                &format!("SELECT value FROM {META_TABLE} WHERE key = ?1"),
                [SCHEMA_VERSION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => parse_version(0, &raw),
            None => Ok(SchemaVersion::ZERO),
        }
    };
    read().map_err(MigrationError::State)
}

/// Reads the migration history, oldest first.
///
/// # Errors
///
/// Returns `MigrationError::State` if the history table cannot be queried
/// or holds malformed rows.
pub fn read_history(conn: &Connection) -> Result<Vec<HistoryEntry>, MigrationError> {
    let read = || -> rusqlite::Result<Vec<HistoryEntry>> {
        if !table_exists(conn, HISTORY_TABLE)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(&format!(
            "SELECT version, description, applied_at FROM {HISTORY_TABLE} ORDER BY applied_at, rowid"
        ))?;
        let rows = stmt.query_map([], |row| {
            let version: String = row.get(0)?;
            let applied_at: String = row.get(2)?;
            let applied_at = DateTime::parse_from_rfc3339(&applied_at)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?
                .with_timezone(&Utc);
            Ok(HistoryEntry {
                version: parse_version(0, &version)?,
                description: row.get(1)?,
                applied_at,
            })
        })?;
        rows.collect()
    };
    read().map_err(MigrationError::State)
}

/// Records a completed step: bumps `schema_version` and appends the
/// history row. Runs inside the step's own transaction.
pub(crate) fn record_step(
    conn: &Connection,
    version: SchemaVersion,
    description: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO {META_TABLE} (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value"
        ),
        params![SCHEMA_VERSION_KEY, version.to_string()],
    )?;
    conn.execute(
        &format!("INSERT INTO {HISTORY_TABLE} (version, description, applied_at) VALUES (?1, ?2, ?3)"),
        params![version.to_string(), description, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}
