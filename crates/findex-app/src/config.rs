//! Application configuration loading from file and environment variables.

use findex_db::{MigrationConfig, PoolConfig};
use serde::Deserialize;
use thiserror::Error;

/// Top-level application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Connection pool settings. `db_path` is required once the table is
    /// present.
    #[serde(default = "default_database")]
    pub database: PoolConfig,

    /// Migration executor settings.
    #[serde(default)]
    pub migrations: MigrationConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "findex_db=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

fn default_database() -> PoolConfig {
    PoolConfig::new("findex.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: default_database(),
            migrations: MigrationConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `FINDEX_DB_PATH` overrides `database.db_path`
/// - `FINDEX_MAX_CONNECTIONS` overrides `database.max_connections`
/// - `FINDEX_MIN_CONNECTIONS` overrides `database.min_connections`
/// - `FINDEX_LOG_LEVEL` overrides `logging.level`
/// - `FINDEX_LOG_JSON` overrides `logging.json` (set to "true" to enable)
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Applies `FINDEX_*` overrides read through `lookup`. Unparsable numbers
/// are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(db_path) = lookup("FINDEX_DB_PATH") {
        config.database.db_path = db_path.into();
    }
    if let Some(max) = lookup("FINDEX_MAX_CONNECTIONS") {
        if let Ok(parsed) = max.parse() {
            config.database.max_connections = parsed;
        }
    }
    if let Some(min) = lookup("FINDEX_MIN_CONNECTIONS") {
        if let Ok(parsed) = min.parse() {
            config.database.min_connections = parsed;
        }
    }
    if let Some(level) = lookup("FINDEX_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = lookup("FINDEX_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).expect("missing file is not an error");
        assert_eq!(config.database.db_path, PathBuf::from("findex.db"));
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.migrations, MigrationConfig::default());
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
    }

    #[test]
    fn parses_nested_tables() {
        let config: Config = toml::from_str(
            r#"
            [database]
            db_path = "/var/lib/findex/index.db"
            max_connections = 4
            connection_timeout = 2.5

            [database.retry]
            max_attempts = 3

            [migrations]
            retain_backups = 2
            lock_stale_after = 60

            [logging]
            level = "debug"
            json = true
            "#,
        )
        .expect("config should parse");

        assert_eq!(config.database.db_path, PathBuf::from("/var/lib/findex/index.db"));
        assert_eq!(config.database.max_connections, 4);
        assert_eq!(config.database.connection_timeout, Duration::from_millis(2500));
        assert_eq!(config.database.retry.max_attempts, 3);
        assert_eq!(config.migrations.retain_backups, 2);
        assert_eq!(config.migrations.lock_stale_after, Duration::from_secs(60));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn database_table_requires_db_path() {
        let result = toml::from_str::<Config>("[database]\nmax_connections = 2\n");
        assert!(result.is_err());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = tempfile::TempDir::new().expect("should create temp dir");
        let path = dir.path().join("findex.toml");
        std::fs::write(&path, "[database\n").expect("should write");
        let err = load_config(path.to_str()).expect_err("should fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("FINDEX_DB_PATH", "/tmp/other.db"),
            ("FINDEX_MAX_CONNECTIONS", "3"),
            ("FINDEX_MIN_CONNECTIONS", "not-a-number"),
            ("FINDEX_LOG_LEVEL", "warn"),
            ("FINDEX_LOG_JSON", "1"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.database.db_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.database.max_connections, 3);
        assert_eq!(config.database.min_connections, 1);
        assert_eq!(config.logging.level, "warn");
        assert!(config.logging.json);
    }
}
