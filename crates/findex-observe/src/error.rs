//! Error types for the diagnostics layer.

use findex_db::MigrationError;

/// Errors that can occur while collecting or rendering diagnostics.
#[derive(Debug, thiserror::Error)]
pub enum ObserveError {
    /// Migration status could not be read.
    #[error("observe migration status error: {0}")]
    Migration(#[from] MigrationError),

    /// JSON serialization failed.
    #[error("observe serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
