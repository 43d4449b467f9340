//! The broker-facing collaborator the processor hands entries to.

use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

/// Header map delivered alongside a payload.
pub type Headers = BTreeMap<String, String>;

/// Failure reported by a publisher.
///
/// The `retryable` hint is logged but never changes the outcome; only the
/// entry's own flag and the retry limit decide dead-lettering.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishError {
    #[error("Publish rejected: {message}")]
    Rejected { message: String, retryable: bool },

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Publisher unavailable: {0}")]
    Unavailable(String),
}

impl PublishError {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Rejected {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn retryable_hint(&self) -> bool {
        match self {
            Self::Rejected { retryable, .. } => *retryable,
            Self::Timeout(_) | Self::Unavailable(_) => true,
        }
    }
}

/// Delivers serialized events to a broker.
///
/// Implementations are called from blocking worker threads and may block.
/// They own their timeouts: a publish that takes too long should return
/// [`PublishError::Timeout`].
pub trait EventPublisher: Send + Sync {
    fn publish(&self, topic: &str, payload: &str, headers: &Headers) -> Result<(), PublishError>;

    fn is_healthy(&self) -> bool {
        true
    }

    /// Short adapter name, e.g. `kafka`.
    fn publisher_type(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_hint() {
        assert!(PublishError::rejected("x").retryable_hint());
        assert!(!PublishError::permanent("x").retryable_hint());
        assert!(PublishError::Timeout(Duration::from_secs(1)).retryable_hint());
        assert!(PublishError::Unavailable("down".into()).retryable_hint());
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            PublishError::rejected("no such topic").to_string(),
            "Publish rejected: no such topic"
        );
        assert_eq!(
            PublishError::Timeout(Duration::from_millis(1500)).to_string(),
            "Publish timed out after 1.5s"
        );
    }
}
