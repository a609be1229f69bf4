//! Ordered catalogue of schema migrations.

use std::borrow::Cow;
use std::fmt;

use findex_types::SchemaVersion;
use rusqlite::Connection;

use super::MigrationError;

type ApplyFn = dyn Fn(&Connection) -> rusqlite::Result<()> + Send + Sync;
type VerifyFn = dyn Fn(&Connection) -> rusqlite::Result<bool> + Send + Sync;

enum Apply {
    Sql(Cow<'static, str>),
    Function(Box<ApplyFn>),
}

/// A verification check run after a migration's forward transformation and
/// before its commit. It returns `Ok(true)` when the schema looks right.
pub struct Verify(Box<VerifyFn>);

impl Verify {
    /// Wraps a check closure.
    pub fn new<F>(check: F) -> Self
    where
        F: Fn(&Connection) -> rusqlite::Result<bool> + Send + Sync + 'static,
    {
        Self(Box::new(check))
    }
}

impl fmt::Debug for Verify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Verify(..)")
    }
}

/// One version step: a forward transformation and an optional check.
pub struct Migration {
    version: SchemaVersion,
    description: String,
    apply: Apply,
    verify: Option<Verify>,
}

fn check_header(version: SchemaVersion, description: &str) -> Result<(), MigrationError> {
    if version.is_zero() {
        return Err(MigrationError::Registration(
            "migration version must be above 0.0.0".into(),
        ));
    }
    if description.trim().is_empty() {
        return Err(MigrationError::Registration(format!(
            "migration {version} has an empty description"
        )));
    }
    Ok(())
}

impl Migration {
    /// A migration whose transformation is a batch of SQL statements.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Registration` for version `0.0.0`, an empty
    /// description, or an empty SQL body.
    pub fn sql(
        version: SchemaVersion,
        description: impl Into<String>,
        sql: impl Into<Cow<'static, str>>,
    ) -> Result<Self, MigrationError> {
        let description = description.into();
        check_header(version, &description)?;
        let sql = sql.into();
        if sql.trim().is_empty() {
            return Err(MigrationError::Registration(format!(
                "migration {version} has an empty SQL body"
            )));
        }
        Ok(Self {
            version,
            description,
            apply: Apply::Sql(sql),
            verify: None,
        })
    }

    /// A migration whose transformation is arbitrary code run on the step's
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Registration` for version `0.0.0` or an
    /// empty description.
    pub fn function<F>(
        version: SchemaVersion,
        description: impl Into<String>,
        apply: F,
    ) -> Result<Self, MigrationError>
    where
        F: Fn(&Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        let description = description.into();
        check_header(version, &description)?;
        Ok(Self {
            version,
            description,
            apply: Apply::Function(Box::new(apply)),
            verify: None,
        })
    }

    /// Attaches a verification check.
    #[must_use]
    pub fn with_verify<F>(mut self, check: F) -> Self
    where
        F: Fn(&Connection) -> rusqlite::Result<bool> + Send + Sync + 'static,
    {
        self.verify = Some(Verify::new(check));
        self
    }

    /// Version this step migrates to.
    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    /// Human-readable summary recorded with the version.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether a post-apply check is attached.
    pub fn has_verify(&self) -> bool {
        self.verify.is_some()
    }

    pub(crate) fn apply(&self, conn: &Connection) -> rusqlite::Result<()> {
        match &self.apply {
            Apply::Sql(sql) => conn.execute_batch(sql),
            Apply::Function(f) => f(conn),
        }
    }

    /// Runs the check, or returns `None` when there is none.
    pub(crate) fn verify(&self, conn: &Connection) -> Option<rusqlite::Result<bool>> {
        self.verify.as_ref().map(|Verify(check)| check(conn))
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.apply {
            Apply::Sql(_) => "sql",
            Apply::Function(_) => "function",
        };
        f.debug_struct("Migration")
            .field("version", &self.version)
            .field("description", &self.description)
            .field("kind", &kind)
            .field("verify", &self.verify.is_some())
            .finish()
    }
}

/// Migrations in strictly ascending version order.
///
/// Registration rejects duplicates and out-of-order versions, so the
/// catalogue is always a chain that can be applied front to back.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a code migration with an optional check.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Registration` if the record is invalid or
    /// `version` does not come after every registered version.
    pub fn register<F>(
        &mut self,
        version: SchemaVersion,
        description: impl Into<String>,
        apply: F,
        verify: Option<Verify>,
    ) -> Result<(), MigrationError>
    where
        F: Fn(&Connection) -> rusqlite::Result<()> + Send + Sync + 'static,
    {
        let mut migration = Migration::function(version, description, apply)?;
        migration.verify = verify;
        self.push(migration)
    }

    /// Appends a prepared migration.
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::Registration` if `migration` does not come
    /// after every registered version.
    pub fn push(&mut self, migration: Migration) -> Result<(), MigrationError> {
        if let Some(last) = self.latest() {
            if migration.version == last {
                return Err(MigrationError::Registration(format!(
                    "migration {} is already registered",
                    migration.version
                )));
            }
            if migration.version < last {
                return Err(MigrationError::Registration(format!(
                    "migration {} registered after {last}; versions must ascend",
                    migration.version
                )));
            }
        }
        self.migrations.push(migration);
        Ok(())
    }

    /// Migrations newer than `current`, oldest first.
    pub fn pending(&self, current: SchemaVersion) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| m.version > current)
            .collect()
    }

    /// Highest registered version.
    pub fn latest(&self) -> Option<SchemaVersion> {
        self.migrations.last().map(|m| m.version)
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    /// Migrations in ascending version order.
    pub fn iter(&self) -> impl Iterator<Item = &Migration> {
        self.migrations.iter()
    }
}
