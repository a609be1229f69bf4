//! Write transactions and nested savepoints on pooled connections.
//!
//! A [`Transaction`] owns its leased connection for its whole life, so the
//! connection cannot return to the pool while the transaction is open.
//! Dropping a transaction without committing rolls it back, which also
//! covers panics unwinding through caller code.

use std::cell::RefCell;
use std::fmt;
use std::ops::Deref;

use rusqlite::Connection;

use crate::connection::PooledConnection;
use crate::error::PoolError;
use crate::pool::ConnectionPool;

/// Checks that `name` can be spliced into a `SAVEPOINT` statement.
fn validate_savepoint_name(name: &str) -> Result<(), PoolError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(PoolError::InvalidSavepointName(name.to_owned()))
    }
}

/// An open write transaction.
///
/// Created by [`ConnectionPool::begin`]. The transaction starts with
/// `BEGIN IMMEDIATE`, so it holds the database's write lock from the start.
/// It dereferences to [`rusqlite::Connection`] for running statements.
pub struct Transaction {
    conn: PooledConnection,
    savepoints: RefCell<Vec<String>>,
    /// First savepoint ordering violation as `(expected, found)`.
    poisoned: RefCell<Option<(String, String)>>,
    finished: bool,
}

impl Transaction {
    fn new(conn: PooledConnection) -> Self {
        Self {
            conn,
            savepoints: RefCell::new(Vec::new()),
            poisoned: RefCell::new(None),
            finished: false,
        }
    }

    /// Identifier of the pooled connection carrying this transaction.
    pub fn connection_id(&self) -> u64 {
        self.conn.id()
    }

    /// Number of savepoints currently open.
    pub fn savepoint_depth(&self) -> usize {
        self.savepoints.borrow().len()
    }

    /// Returns `true` after a savepoint was finished out of order. A
    /// poisoned transaction can only be rolled back.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.borrow().is_some()
    }

    /// Commits the transaction.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::SavepointOrder` if the transaction was poisoned
    /// by an out-of-order savepoint (it is rolled back instead), or the
    /// SQLite error raised by `COMMIT`.
    pub fn commit(mut self) -> Result<(), PoolError> {
        let poisoned = self.poisoned.borrow_mut().take();
        if let Some((expected, found)) = poisoned {
            return Err(PoolError::SavepointOrder { expected, found });
        }
        self.conn.execute_batch("COMMIT")?;
        self.finished = true;
        Ok(())
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// Returns the SQLite error raised by `ROLLBACK`. The connection is then
    /// flagged so the pool closes it instead of reusing it.
    pub fn rollback(mut self) -> Result<(), PoolError> {
        self.finished = true;
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            self.conn.mark_unhealthy();
            return Err(e.into());
        }
        Ok(())
    }

    /// Opens a nested savepoint.
    ///
    /// Savepoints must be finished in LIFO order. Finishing one that is not
    /// the innermost fails with `PoolError::SavepointOrder` and poisons the
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidSavepointName` unless `name` matches
    /// `[A-Za-z_][A-Za-z0-9_]*`, or the SQLite error raised by `SAVEPOINT`.
    pub fn savepoint(&self, name: &str) -> Result<Savepoint<'_>, PoolError> {
        validate_savepoint_name(name)?;
        self.conn.execute_batch(&format!("SAVEPOINT {name}"))?;
        let mut stack = self.savepoints.borrow_mut();
        stack.push(name.to_owned());
        Ok(Savepoint {
            tx: self,
            name: name.to_owned(),
            depth: stack.len() - 1,
            finished: false,
        })
    }

    /// Runs `f` inside a savepoint named `name`: released when `f` returns
    /// `Ok`, rolled back when it returns `Err`. The enclosing transaction
    /// stays usable either way.
    ///
    /// # Errors
    ///
    /// Errors from opening or finishing the savepoint are converted into
    /// `E`; errors from `f` are returned unchanged.
    pub fn with_savepoint<T, E, F>(&self, name: &str, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction) -> Result<T, E>,
        E: From<PoolError>,
    {
        let savepoint = self.savepoint(name)?;
        match f(self) {
            Ok(value) => {
                savepoint.release()?;
                Ok(value)
            }
            Err(e) => {
                savepoint.rollback()?;
                Err(e)
            }
        }
    }

    fn poison(&self, expected: String, found: String) -> PoolError {
        let mut poisoned = self.poisoned.borrow_mut();
        if poisoned.is_none() {
            *poisoned = Some((expected.clone(), found.clone()));
        }
        tracing::error!(
            connection_id = self.conn.id(),
            expected = %expected,
            found = %found,
            "savepoint finished out of order"
        );
        PoolError::SavepointOrder { expected, found }
    }

    fn close_savepoint(&self, depth: usize, name: &str, rollback: bool) -> Result<(), PoolError> {
        let mut stack = self.savepoints.borrow_mut();
        if stack.len() != depth + 1 {
            let expected = stack.last().cloned().unwrap_or_default();
            drop(stack);
            return Err(self.poison(expected, name.to_owned()));
        }
        stack.pop();
        drop(stack);

        let sql = if rollback {
            format!("ROLLBACK TO SAVEPOINT {name}; RELEASE SAVEPOINT {name};")
        } else {
            format!("RELEASE SAVEPOINT {name};")
        };
        self.conn.execute_batch(&sql)?;
        Ok(())
    }
}

impl Deref for Transaction {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("connection_id", &self.conn.id())
            .field("savepoints", &self.savepoints.borrow())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.conn.execute_batch("ROLLBACK") {
            tracing::warn!(
                connection_id = self.conn.id(),
                error = %e,
                "rollback of abandoned transaction failed"
            );
            self.conn.mark_unhealthy();
        } else {
            tracing::debug!(connection_id = self.conn.id(), "rolled back abandoned transaction");
        }
    }
}

/// A named savepoint inside a [`Transaction`].
///
/// Dropping an unfinished savepoint rolls back to it and releases it.
pub struct Savepoint<'tx> {
    tx: &'tx Transaction,
    name: String,
    depth: usize,
    finished: bool,
}

impl Savepoint<'_> {
    /// The savepoint's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keeps the savepoint's changes as part of the enclosing transaction.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::SavepointOrder` if a savepoint opened after this
    /// one is still open.
    pub fn release(mut self) -> Result<(), PoolError> {
        self.finished = true;
        self.tx.close_savepoint(self.depth, &self.name, false)
    }

    /// Discards every change made since the savepoint was opened.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::SavepointOrder` if a savepoint opened after this
    /// one is still open.
    pub fn rollback(mut self) -> Result<(), PoolError> {
        self.finished = true;
        self.tx.close_savepoint(self.depth, &self.name, true)
    }
}

impl Deref for Savepoint<'_> {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.tx
    }
}

impl fmt::Debug for Savepoint<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Savepoint")
            .field("name", &self.name)
            .field("depth", &self.depth)
            .finish()
    }
}

impl Drop for Savepoint<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(e) = self.tx.close_savepoint(self.depth, &self.name, true) {
            tracing::warn!(savepoint = %self.name, error = %e, "savepoint rollback on drop failed");
        }
    }
}

impl ConnectionPool {
    /// Leases a connection and begins an immediate write transaction on it.
    ///
    /// A busy database is retried with the pool's retry policy.
    ///
    /// # Errors
    ///
    /// Returns acquisition errors, or `PoolError::WriteContention` when
    /// another writer holds the lock through every retry.
    pub fn begin(&self) -> Result<Transaction, PoolError> {
        let conn = self.acquire()?;
        self.with_write_retry(|| conn.execute_batch("BEGIN IMMEDIATE").map_err(PoolError::from))?;
        Ok(Transaction::new(conn))
    }

    /// Runs `f` in a write transaction, committing when it returns `Ok` and
    /// rolling back when it returns `Err` or panics. The connection goes
    /// back to the pool in every case.
    ///
    /// # Errors
    ///
    /// Pool, begin and commit failures are converted into `E`; errors from
    /// `f` are returned unchanged after the rollback.
    pub fn transaction<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Transaction) -> Result<T, E>,
        E: From<PoolError>,
    {
        let tx = self.begin()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed transaction body failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use std::panic::{self, AssertUnwindSafe};
    use std::time::Duration;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ConnectionPool) {
        let dir = TempDir::new().expect("should create temp dir");
        let config = PoolConfig {
            max_connections: 2,
            health_check_interval: Duration::ZERO,
            ..PoolConfig::new(dir.path().join("tx.db"))
        };
        let pool = ConnectionPool::open(config).expect("pool should open");
        pool.scoped_connection(|conn| {
            conn.execute_batch("CREATE TABLE items (name TEXT NOT NULL)")
                .map_err(PoolError::from)
        })
        .expect("should create table");
        (dir, pool)
    }

    fn names(pool: &ConnectionPool) -> Vec<String> {
        pool.scoped_connection(|conn| {
            let mut stmt = conn.prepare("SELECT name FROM items ORDER BY rowid")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect::<Result<Vec<String>, _>>().map_err(PoolError::from)
        })
        .expect("should read items")
    }

    #[test]
    fn closure_commits_on_ok() {
        let (_dir, pool) = setup();
        pool.transaction(|tx| {
            tx.execute("INSERT INTO items (name) VALUES ('a')", [])?;
            Ok::<_, PoolError>(())
        })
        .expect("transaction should commit");
        assert_eq!(names(&pool), vec!["a"]);
        assert_eq!(pool.get_stats().active, 0);
    }

    #[test]
    fn closure_rolls_back_on_err() {
        let (_dir, pool) = setup();
        let err = pool
            .transaction(|tx| {
                tx.execute("INSERT INTO items (name) VALUES ('a')", [])?;
                Err::<(), _>(PoolError::InvalidConfig("boom".into()))
            })
            .expect_err("body error should surface");
        assert!(matches!(err, PoolError::InvalidConfig(_)));
        assert!(names(&pool).is_empty());
    }

    #[test]
    fn panic_in_body_rolls_back_and_releases() {
        let (_dir, pool) = setup();
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _ = pool.transaction(|tx| -> Result<(), PoolError> {
                tx.execute("INSERT INTO items (name) VALUES ('a')", [])?;
                panic!("caller bug");
            });
        }));
        assert!(result.is_err());
        assert!(names(&pool).is_empty());
        assert_eq!(pool.get_stats().active, 0, "connection must be released");
    }

    #[test]
    fn dropped_guard_rolls_back() {
        let (_dir, pool) = setup();
        {
            let tx = pool.begin().expect("should begin");
            tx.execute("INSERT INTO items (name) VALUES ('a')", [])
                .expect("should insert");
        }
        assert!(names(&pool).is_empty());
    }

    #[test]
    fn savepoint_rollback_keeps_outer_work() {
        let (_dir, pool) = setup();
        let tx = pool.begin().expect("should begin");
        tx.execute("INSERT INTO items (name) VALUES ('outer')", [])
            .expect("should insert");

        let result = tx.with_savepoint("inner", |tx| {
            tx.execute("INSERT INTO items (name) VALUES ('inner')", [])?;
            Err::<(), _>(PoolError::InvalidConfig("inner failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(tx.savepoint_depth(), 0);

        tx.execute("INSERT INTO items (name) VALUES ('after')", [])
            .expect("outer transaction should stay usable");
        tx.commit().expect("should commit");
        assert_eq!(names(&pool), vec!["outer", "after"]);
    }

    #[test]
    fn nested_savepoints_release_in_order() {
        let (_dir, pool) = setup();
        let tx = pool.begin().expect("should begin");
        let outer = tx.savepoint("outer").expect("should open outer");
        outer
            .execute("INSERT INTO items (name) VALUES ('x')", [])
            .expect("should insert");
        let inner = tx.savepoint("inner").expect("should open inner");
        assert_eq!(tx.savepoint_depth(), 2);
        inner.rollback().expect("innermost can roll back");
        outer.release().expect("outer is now innermost");
        tx.commit().expect("should commit");
        assert_eq!(names(&pool), vec!["x"]);
    }

    #[test]
    fn out_of_order_release_is_rejected_and_poisons() {
        let (_dir, pool) = setup();
        let tx = pool.begin().expect("should begin");
        tx.execute("INSERT INTO items (name) VALUES ('x')", [])
            .expect("should insert");
        let outer = tx.savepoint("outer").expect("should open outer");
        let inner = tx.savepoint("inner").expect("should open inner");

        match outer.release() {
            Err(PoolError::SavepointOrder { expected, found }) => {
                assert_eq!(expected, "inner");
                assert_eq!(found, "outer");
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(tx.is_poisoned());
        drop(inner);

        let err = tx.commit().expect_err("poisoned transaction cannot commit");
        assert!(matches!(err, PoolError::SavepointOrder { .. }));
        assert!(names(&pool).is_empty(), "poisoned transaction is rolled back");
    }

    #[test]
    fn savepoint_names_must_be_identifiers() {
        let (_dir, pool) = setup();
        let tx = pool.begin().expect("should begin");
        for bad in ["", "1abc", "a b", "x; DROP TABLE items"] {
            assert!(
                matches!(tx.savepoint(bad), Err(PoolError::InvalidSavepointName(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(tx.savepoint("_ok_1").is_ok());
    }
}
