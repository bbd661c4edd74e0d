//! Error types for event store backends.

use thiserror::Error;

/// Errors an [`EventStore`](crate::EventStore) backend can report.
///
/// An unknown event id is not an error; replay reports it as `None`.
#[derive(Debug, Error)]
pub enum EventStoreError {
    /// Message (de)serialization failed.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Backend storage failure.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Convenience type alias for event store results.
pub type Result<T> = std::result::Result<T, EventStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serde_error_display() {
        let serde_err = serde_json::from_str::<String>("not json").unwrap_err();
        let err = EventStoreError::from(serde_err);
        assert!(err.to_string().starts_with("serde error"));
    }

    #[test]
    fn backend_error_display() {
        let err = EventStoreError::Backend("disk full".into());
        assert_eq!(err.to_string(), "backend error: disk full");
    }
}
