//! Diagnostics for the findex storage core.
//!
//! Passive observers attach to a [`findex_db::ConnectionPool`] and a
//! [`findex_db::MigrationExecutor`] and never influence their behaviour:
//!
//! - [`TracingObserver`] logs every event through `tracing`.
//! - [`EventJournal`] keeps the most recent events in a bounded ring buffer.
//! - [`DiagnosticsReport`] combines pool statistics, migration status and
//!   the journal into one serialisable snapshot.
//!
//! # Event domains
//!
//! | Domain | Example events |
//! |--------|---------------|
//! | `POOL` | `CONNECTION_ACQUIRED`, `CONNECTION_RECYCLED`, `WRITE_CONTENTION` |
//! | `MIGRATION` | `MIGRATION_STATE_CHANGED`, `MIGRATION_APPLIED`, `BACKUP_RESTORED` |
//!
//! # Usage
//!
//! ```rust,ignore
//! let journal = Arc::new(EventJournal::new());
//! pool.add_observer(journal.clone());
//! pool.add_observer(Arc::new(TracingObserver));
//! executor.add_observer(journal.clone());
//!
//! let report = DiagnosticsReport::collect(&pool, &executor, &journal)?;
//! println!("{}", report.to_json_pretty()?);
//! ```

mod error;
mod event;
mod journal;
mod report;
mod tracing_observer;

pub use error::ObserveError;
pub use event::{DiagnosticEvent, EventDomain, EventPayload};
pub use journal::{EventJournal, DEFAULT_JOURNAL_CAPACITY};
pub use report::DiagnosticsReport;
pub use tracing_observer::TracingObserver;
