//! End-to-end tests for the startup sequence and operator commands.

use std::time::Duration;

use chrono::Utc;
use findex_app::{recover_lock, startup, startup_with_registry, status, Config, StartupError};
use findex_db::migrate::lock_path;
use findex_db::{
    read_history, read_schema_version, ConnectionPool, LockInfo, LockState, Migration,
    MigrationError, MigrationRegistry, PoolConfig,
};
use findex_types::SchemaVersion;
use tempfile::TempDir;

fn test_config(dir: &TempDir) -> Config {
    Config {
        database: PoolConfig {
            health_check_interval: Duration::ZERO,
            ..PoolConfig::new(dir.path().join("findex.db"))
        },
        ..Config::default()
    }
}

fn stored_version(config: &Config) -> SchemaVersion {
    let pool = ConnectionPool::open(config.database.clone()).expect("pool should open");
    let conn = pool.acquire().expect("should acquire");
    let version = read_schema_version(&conn).expect("should read version");
    drop(conn);
    pool.shutdown();
    version
}

fn write_lock(config: &Config, state: LockState) -> LockInfo {
    let info = LockInfo {
        owner: "another-run".into(),
        pid: 4242,
        acquired_at: Utc::now(),
        state,
    };
    let body = serde_json::to_vec(&info).expect("should serialize");
    std::fs::write(lock_path(&config.database.db_path), body).expect("should write lock");
    info
}

#[test]
fn startup_brings_fresh_database_to_latest() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&dir);

    let runtime = startup(&config).expect("startup should succeed");
    assert_eq!(runtime.migration.from, SchemaVersion::ZERO);
    assert_eq!(runtime.migration.to, SchemaVersion::new(1, 3, 0));
    assert_eq!(runtime.migration.applied.len(), 4);

    {
        let conn = runtime.pool.acquire().expect("should acquire");
        let history = read_history(&conn).expect("should read history");
        assert_eq!(history.len(), 4);
        assert_eq!(history[0].version, SchemaVersion::new(1, 0, 0));
    }

    let report = runtime.report().expect("should collect report");
    assert!(report.migration.pending.is_empty());
    assert!(report.recent_events.iter().any(|e| e.kind == "step_applied"));
    runtime.shutdown();
    assert!(runtime.pool.is_shut_down());
}

#[test]
fn second_startup_is_a_noop() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&dir);

    startup(&config).expect("first startup").shutdown();
    let runtime = startup(&config).expect("second startup");
    assert!(runtime.migration.is_noop());
    assert_eq!(runtime.migration.to, SchemaVersion::new(1, 3, 0));
    runtime.shutdown();
}

#[test]
fn failing_migration_aborts_startup_and_keeps_prior_schema() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&dir);

    let mut registry = MigrationRegistry::new();
    registry
        .push(
            Migration::sql(
                SchemaVersion::new(1, 0, 0),
                "files",
                "CREATE TABLE files (id INTEGER PRIMARY KEY)",
            )
            .expect("valid migration"),
        )
        .expect("register");
    registry
        .push(
            Migration::sql(SchemaVersion::new(1, 1, 0), "broken", "CREATE TABLE (")
                .expect("valid migration"),
        )
        .expect("register");

    let err = match startup_with_registry(&config, registry) {
        Ok(_) => panic!("startup should fail"),
        Err(e) => e,
    };
    assert!(matches!(
        err,
        StartupError::Migration(MigrationError::Apply { version, .. })
            if version == SchemaVersion::new(1, 1, 0)
    ));
    assert_eq!(stored_version(&config), SchemaVersion::ZERO);
    assert!(!lock_path(&config.database.db_path).exists());
}

#[test]
fn live_lock_is_retried_then_reported() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&dir);
    write_lock(&config, LockState::Running);

    let err = match startup(&config) {
        Ok(_) => panic!("startup should fail while the lock is held"),
        Err(e) => e,
    };
    assert!(matches!(
        err,
        StartupError::Migration(MigrationError::LockHeld { stale: false, pid: 4242, .. })
    ));
    assert_eq!(stored_version(&config), SchemaVersion::ZERO);
}

#[test]
fn status_reports_pending_without_migrating() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&dir);

    let report = status(&config).expect("status should succeed");
    assert_eq!(report.current, SchemaVersion::ZERO);
    assert_eq!(report.latest, Some(SchemaVersion::new(1, 3, 0)));
    assert_eq!(report.pending.len(), 4);
    assert!(report.lock.is_none());
    assert_eq!(stored_version(&config), SchemaVersion::ZERO);
}

#[test]
fn recover_lock_handles_failed_live_and_missing_locks() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = test_config(&dir);

    assert_eq!(recover_lock(&config, false).expect("no lock is fine"), None);

    let failed = write_lock(&config, LockState::Failed);
    assert_eq!(
        recover_lock(&config, false).expect("failed lock is removable"),
        Some(failed)
    );

    let live = write_lock(&config, LockState::Running);
    let err = recover_lock(&config, false).expect_err("live lock needs force");
    assert!(matches!(
        err,
        StartupError::Migration(MigrationError::LockHeld { .. })
    ));
    assert_eq!(
        recover_lock(&config, true).expect("forced recovery"),
        Some(live)
    );
    assert!(!lock_path(&config.database.db_path).exists());
}
