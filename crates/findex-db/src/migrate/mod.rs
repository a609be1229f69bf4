//! Versioned schema migrations with backup, verification and rollback.
//!
//! A [`MigrationRegistry`] holds the ordered chain of [`Migration`]s and a
//! [`MigrationExecutor`] brings a database up to the latest version through
//! a [`ConnectionPool`](crate::ConnectionPool). Each run takes a sidecar
//! lock file, holds the pool exclusively, copies the database file aside,
//! then applies every pending step in its own transaction. A failing step
//! rolls its transaction back and the database is restored from the copy,
//! undoing any step that already committed in the same run.

mod backup;
mod builtin;
mod error;
mod executor;
mod lock;
mod metadata;
mod registry;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::serde_secs;

pub use backup::{backup_file_name, default_backup_dir, list as list_backups, prune as prune_backups};
pub use builtin::builtin_registry;
pub use error::MigrationError;
pub use executor::{
    MigrationEvent, MigrationExecutor, MigrationObserver, MigrationReport, MigrationState,
    MigrationStatus,
};
pub use lock::{lock_path, LockInfo, LockState};
pub use metadata::{read_history, read_schema_version, HistoryEntry, HISTORY_TABLE, META_TABLE};
pub use registry::{Migration, MigrationRegistry, Verify};

/// Settings for [`MigrationExecutor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationConfig {
    /// Where pre-run backups go. Defaults to the database's directory.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// Backups kept after successful runs. Zero deletes the backup as soon
    /// as the run commits. Backups of failed runs are always kept.
    #[serde(default)]
    pub retain_backups: usize,

    /// Age after which a held lock is reported as stale.
    #[serde(default = "default_lock_stale_after", with = "serde_secs")]
    pub lock_stale_after: Duration,

    /// How long to wait for in-flight connections before taking the pool
    /// exclusively.
    #[serde(default = "default_exclusive_timeout", with = "serde_secs")]
    pub exclusive_timeout: Duration,
}

fn default_lock_stale_after() -> Duration {
    Duration::from_secs(1_800)
}

fn default_exclusive_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            backup_dir: None,
            retain_backups: 0,
            lock_stale_after: default_lock_stale_after(),
            exclusive_timeout: default_exclusive_timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply_to_empty_input() {
        let config: MigrationConfig = serde_json::from_str("{}").expect("should deserialize");
        assert_eq!(config, MigrationConfig::default());
        assert_eq!(config.lock_stale_after, Duration::from_secs(1_800));
    }

    #[test]
    fn durations_are_seconds() {
        let config: MigrationConfig =
            serde_json::from_str(r#"{"lock_stale_after": 90, "exclusive_timeout": 0.5, "retain_backups": 3}"#)
                .expect("should deserialize");
        assert_eq!(config.lock_stale_after, Duration::from_secs(90));
        assert_eq!(config.exclusive_timeout, Duration::from_millis(500));
        assert_eq!(config.retain_backups, 3);
    }
}
