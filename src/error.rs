//! Error types for journal operations

use thiserror::Error;

/// Result type for journal operations
pub type JournalResult<T> = Result<T, JournalError>;

/// Errors that can occur in journal operations
///
/// Version conflicts are deliberately absent: they are resolved inside the
/// store and reported through [`crate::event_store::AppendOutcome`].
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Failed to serialize event for instance {instance} (version {version}): {source}")]
    Serialization {
        instance: String,
        version: i64,
        #[source]
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Persistence worker is no longer running")]
    WorkerStopped,
}

impl JournalError {
    /// Whether this is a uniqueness violation on `(instance_id, version)`
    pub fn is_duplicate_key(&self) -> bool {
        match self {
            JournalError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.extended_code,
                rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE | rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
            ),
            _ => false,
        }
    }
}
