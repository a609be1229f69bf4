//! Pool configuration and its invariant checks.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::retry::RetryPolicy;

/// Configuration for a [`ConnectionPool`](crate::ConnectionPool).
///
/// Durations are written as (fractional) seconds in configuration files.
/// The record is fixed once the pool is constructed; the pool keeps its own
/// copy and exposes it read-only.
///
/// # Examples
///
/// ```
/// use findex_db::PoolConfig;
/// use std::time::Duration;
///
/// let config = PoolConfig {
///     max_connections: 4,
///     connection_timeout: Duration::from_millis(500),
///     ..PoolConfig::new("index.db")
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Path to the SQLite database file.
    pub db_path: PathBuf,

    /// Upper bound on open connections (leased + idle).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Connections opened eagerly by `initialize` and kept alive afterwards.
    #[serde(default = "default_min_connections")]
    pub min_connections: usize,

    /// How long `acquire` waits for a free connection.
    #[serde(default = "default_connection_timeout", with = "serde_secs")]
    pub connection_timeout: Duration,

    /// Connections older than this are closed instead of being reused.
    #[serde(default = "default_connection_max_age", with = "serde_secs")]
    pub connection_max_age: Duration,

    /// Interval between health probes. Zero disables the background monitor
    /// and probe-on-checkout.
    #[serde(default = "default_health_check_interval", with = "serde_secs")]
    pub health_check_interval: Duration,

    /// How long SQLite itself waits on a locked database before reporting
    /// `SQLITE_BUSY`.
    #[serde(default = "default_busy_timeout", with = "serde_secs")]
    pub busy_timeout: Duration,

    /// Backoff policy applied to write contention.
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_max_connections() -> usize {
    10
}

fn default_min_connections() -> usize {
    1
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_connection_max_age() -> Duration {
    Duration::from_secs(600)
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(1)
}

impl PoolConfig {
    /// Creates a configuration for `db_path` with every other field at its
    /// default.
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connection_timeout: default_connection_timeout(),
            connection_max_age: default_connection_max_age(),
            health_check_interval: default_health_check_interval(),
            busy_timeout: default_busy_timeout(),
            retry: RetryPolicy::default(),
        }
    }

    /// Checks the invariants a pool relies on.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` naming the first violated field.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.db_path.as_os_str().is_empty() {
            return Err(PoolError::InvalidConfig("db_path must not be empty".into()));
        }
        if self.max_connections == 0 {
            return Err(PoolError::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PoolError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        if self.connection_timeout.is_zero() {
            return Err(PoolError::InvalidConfig(
                "connection_timeout must be greater than zero".into(),
            ));
        }
        if self.connection_max_age.is_zero() {
            return Err(PoolError::InvalidConfig(
                "connection_max_age must be greater than zero".into(),
            ));
        }
        self.retry.validate()
    }

    /// Returns `true` when the path names an in-memory database.
    pub fn is_in_memory(&self) -> bool {
        let path = self.db_path.to_string_lossy();
        path == ":memory:" || path.starts_with("file::memory:")
    }
}

/// Serde adapter for `Duration` values written as seconds (`2.5` = 2.5 s).
pub mod serde_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Writes the duration as fractional seconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    /// Reads fractional seconds, rejecting negative and non-finite values.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(format!("invalid duration in seconds: {secs}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = PoolConfig::new("index.db");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.connection_max_age, Duration::from_secs(600));
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_min_above_max() {
        let config = PoolConfig {
            max_connections: 2,
            min_connections: 3,
            ..PoolConfig::new("index.db")
        };
        let err = config.validate().expect_err("min > max should be rejected");
        assert!(err.to_string().contains("min_connections"));
    }

    #[test]
    fn rejects_zero_capacity_and_empty_path() {
        let zero = PoolConfig {
            max_connections: 0,
            min_connections: 0,
            ..PoolConfig::new("index.db")
        };
        assert!(matches!(zero.validate(), Err(PoolError::InvalidConfig(_))));

        let empty = PoolConfig::new("");
        assert!(matches!(empty.validate(), Err(PoolError::InvalidConfig(_))));
    }

    #[test]
    fn deserializes_seconds_with_defaults() {
        let config: PoolConfig = serde_json::from_str(
            r#"{ "db_path": "a.db", "connection_timeout": 0.25, "max_connections": 3 }"#,
        )
        .expect("config should parse");
        assert_eq!(config.connection_timeout, Duration::from_millis(250));
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.connection_max_age, Duration::from_secs(600));
    }

    #[test]
    fn db_path_is_required() {
        let result = serde_json::from_str::<PoolConfig>(r#"{ "max_connections": 3 }"#);
        assert!(result.is_err(), "db_path has no default");
    }

    #[test]
    fn negative_durations_are_rejected() {
        let result = serde_json::from_str::<PoolConfig>(
            r#"{ "db_path": "a.db", "connection_timeout": -1.0 }"#,
        );
        assert!(result.is_err());
    }
}
