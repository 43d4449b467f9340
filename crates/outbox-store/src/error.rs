//! Store error types.

use crate::OutboxStatus;
use thiserror::Error;

/// Errors raised by an [`OutboxEntry`](crate::OutboxEntry) itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EntryError {
    /// A field failed construction-time validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A transition was attempted out of a terminal state.
    #[error("Invalid transition for entry {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: OutboxStatus,
        to: OutboxStatus,
    },
}

/// Database error type.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid data error
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Entry rule violation
    #[error(transparent)]
    Entry(#[from] EntryError),
}

/// Result type alias using DatabaseError.
pub type DatabaseResult<T> = Result<T, DatabaseError>;
