//! Copy-based database backups taken before a migration run.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use findex_types::SchemaVersion;

use super::MigrationError;
use crate::pool::ExclusiveAccess;

fn backup_io(path: &Path) -> impl FnOnce(io::Error) -> MigrationError + '_ {
    move |source| MigrationError::Backup {
        path: path.to_path_buf(),
        source,
    }
}

fn file_name(db_path: &Path) -> OsString {
    db_path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("database"))
}

fn sidecar(db_path: &Path, suffix: &str) -> PathBuf {
    let mut name = db_path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Backup file name: `<db file>.v<version>-<UTC timestamp>.bak`.
pub fn backup_file_name(db_path: &Path, version: SchemaVersion, at: DateTime<Utc>) -> OsString {
    let mut name = file_name(db_path);
    name.push(format!(".v{version}-{}.bak", at.format("%Y%m%dT%H%M%S%.3fZ")));
    name
}

/// Directory backups go to when none is configured: next to the database.
pub fn default_backup_dir(db_path: &Path) -> PathBuf {
    match db_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Checkpoints the WAL into the main file and copies it into `dir`.
///
/// The caller must hold the pool exclusively so no other connection writes
/// while the file is copied.
pub(crate) fn create(
    access: &ExclusiveAccess<'_>,
    dir: &Path,
    version: SchemaVersion,
) -> Result<PathBuf, MigrationError> {
    let pool = access.pool();
    let db_path = pool.config().db_path.as_path();
    if pool.config().is_in_memory() {
        return Err(MigrationError::Backup {
            path: db_path.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::Unsupported,
                "in-memory databases cannot be backed up",
            ),
        });
    }

    fs::create_dir_all(dir).map_err(backup_io(dir))?;

    {
        let conn = pool.acquire()?;
        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(crate::PoolError::from)?;
        if busy != 0 {
            tracing::warn!(log_frames, checkpointed, "WAL checkpoint before backup was incomplete");
        }
    }

    let target = dir.join(backup_file_name(db_path, version, Utc::now()));
    let bytes = fs::copy(db_path, &target).map_err(backup_io(&target))?;
    tracing::info!(
        path = %target.display(),
        version = %version,
        bytes,
        "database backup created"
    );
    Ok(target)
}

/// Replaces the database file with `backup`.
///
/// Every pooled connection is closed first and the WAL and shared-memory
/// sidecars are removed so the restored file is read as-is. The pool is
/// refilled afterwards.
pub(crate) fn restore(access: &ExclusiveAccess<'_>, backup: &Path) -> Result<(), MigrationError> {
    let db_path = access.pool().config().db_path.clone();
    if !backup.is_file() {
        return Err(MigrationError::Backup {
            path: backup.to_path_buf(),
            source: io::Error::new(io::ErrorKind::NotFound, "backup file is missing"),
        });
    }

    let closed = access.reset_connections()?;
    for suffix in ["-wal", "-shm"] {
        let path = sidecar(&db_path, suffix);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed database sidecar"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(backup_io(&path)(e)),
        }
    }
    fs::copy(backup, &db_path).map_err(backup_io(backup))?;
    access.replenish();

    tracing::warn!(
        backup = %backup.display(),
        closed_connections = closed,
        "database restored from backup"
    );
    Ok(())
}

/// Backups of `db_path` in `dir`, newest first.
///
/// # Errors
///
/// Returns `MigrationError::Backup` if `dir` cannot be listed.
pub fn list(dir: &Path, db_path: &Path) -> Result<Vec<PathBuf>, MigrationError> {
    let mut prefix = file_name(db_path).to_string_lossy().into_owned();
    prefix.push_str(".v");

    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(backup_io(dir)(e)),
    };

    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.map_err(backup_io(dir))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.starts_with(&prefix) || !name.ends_with(".bak") {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .map_err(backup_io(&entry.path()))?;
        backups.push((modified, name, entry.path()));
    }
    backups.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    Ok(backups.into_iter().map(|(_, _, path)| path).collect())
}

/// Deletes all but the `keep` newest backups of `db_path`. Returns the
/// removed paths.
///
/// # Errors
///
/// Returns `MigrationError::Backup` if a backup cannot be listed or removed.
pub fn prune(dir: &Path, db_path: &Path, keep: usize) -> Result<Vec<PathBuf>, MigrationError> {
    let mut removed = Vec::new();
    for path in list(dir, db_path)?.into_iter().skip(keep) {
        fs::remove_file(&path).map_err(backup_io(&path))?;
        tracing::debug!(path = %path.display(), "pruned old backup");
        removed.push(path);
    }
    Ok(removed)
}
