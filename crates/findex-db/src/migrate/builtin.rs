//! The application's own schema, embedded at compile time.

use findex_types::SchemaVersion;
use rusqlite::Connection;

use super::{Migration, MigrationError, MigrationRegistry};

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM pragma_table_info(?1) WHERE name = ?2)",
        [table, column],
        |row| row.get(0),
    )
}

/// Registry of every migration shipped with the application, in order.
///
/// New migrations are appended here with a higher version.
///
/// # Errors
///
/// Returns `MigrationError::Registration` only if the embedded list itself
/// is malformed.
pub fn builtin_registry() -> Result<MigrationRegistry, MigrationError> {
    let mut registry = MigrationRegistry::new();

    registry.push(
        Migration::sql(
            SchemaVersion::new(1, 0, 0),
            "files table",
            include_str!("sql/1.0.0_files.sql"),
        )?
        .with_verify(|conn| table_exists(conn, "files")),
    )?;

    registry.push(
        Migration::sql(
            SchemaVersion::new(1, 1, 0),
            "crawl roots",
            include_str!("sql/1.1.0_crawl_roots.sql"),
        )?
        .with_verify(|conn| {
            Ok(table_exists(conn, "crawl_roots")? && column_exists(conn, "files", "root_id")?)
        }),
    )?;

    registry.push(Migration::sql(
        SchemaVersion::new(1, 2, 0),
        "search history",
        include_str!("sql/1.2.0_search_history.sql"),
    )?)?;

    registry.push(
        Migration::sql(
            SchemaVersion::new(1, 3, 0),
            "crawl exclusion patterns",
            include_str!("sql/1.3.0_crawl_exclusions.sql"),
        )?
        .with_verify(|conn| table_exists(conn, "crawl_exclusions")),
    )?;

    Ok(registry)
}
