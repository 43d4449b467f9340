//! Outbox error types.

use outbox_store::{DatabaseError, EntryError};
use thiserror::Error;

/// Outbox error type.
#[derive(Error, Debug)]
pub enum OutboxError {
    /// Input rejected before anything was persisted
    #[error("Validation error: {0}")]
    Validation(String),

    /// Entry state machine violation
    #[error(transparent)]
    Entry(EntryError),

    /// Payload or headers could not be encoded
    #[error("Failed to serialize event payload: {0}")]
    Serialization(#[source] serde_json::Error),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<EntryError> for OutboxError {
    fn from(err: EntryError) -> Self {
        match err {
            EntryError::Validation(message) => Self::Validation(message),
            other => Self::Entry(other),
        }
    }
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;
