//! Error types for the query and transaction layer.

use std::time::Duration;

/// Errors raised by contexts, the context manager, and distributed locks.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A single-row or first-row query returned no rows.
    #[error("query returned no rows")]
    NotFound,

    /// A single-row query returned more than one row.
    #[error("query returned {0} rows where exactly one was expected")]
    MultipleRows(usize),

    /// Transaction lifecycle misuse (double begin, commit without a
    /// transaction, use of a finished transaction).
    #[error("illegal context state: {0}")]
    IllegalState(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The database rejected or failed a call.
    #[error("database error: {0}")]
    Backend(#[from] postgres::Error),

    /// No connection could be checked out of the pool.
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// A SQL template referenced a parameter that was never bound.
    #[error("parameter error: {0}")]
    Parameter(String),

    /// The advisory lock was not granted within the configured wait.
    #[error("timed out after {waited:?} waiting for advisory lock '{name}'")]
    LockTimeout {
        /// Lock name (the migration name).
        name: String,
        /// How long the acquire waited.
        waited: Duration,
    },

    /// The caller's cancellation signal fired while the call was in flight.
    #[error("operation cancelled")]
    Cancelled,

    /// A blocking database task panicked or was aborted.
    #[error("database task failed: {0}")]
    Task(String),

    /// Filesystem access failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DbError {
    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalState(message.into())
    }

    /// Returns the SQLSTATE code when the error came from the server.
    pub fn sql_state(&self) -> Option<&postgres::error::SqlState> {
        match self {
            Self::Backend(e) => e.code(),
            _ => None,
        }
    }
}

impl From<tokio::task::JoinError> for DbError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Task(e.to_string())
    }
}
