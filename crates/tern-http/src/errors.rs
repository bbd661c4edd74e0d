//! Error types for the HTTP binding.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use tern_core::{ErrorCode, ErrorObject, Message};
use thiserror::Error;
use tracing::debug;

use crate::metrics::HTTP_REJECTIONS_TOTAL;

/// Errors that can occur when loading or parsing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A config value was invalid.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Failures of a per-session transport operation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The session engine is gone.
    #[error("session closed")]
    Closed,
    /// `Last-Event-ID` does not name a retained event.
    #[error("unknown event id {0}")]
    UnknownEventId(String),
    /// The client reused the id of a request still in flight.
    #[error("request id {0} is already in flight")]
    DuplicateRequestId(String),
    /// A standalone stream is already attached.
    #[error("a standalone stream is already open for this session")]
    StandaloneConflict,
}

/// A request rejected before it reached the session engine.
///
/// Rendered as a JSON-RPC error body with a 4xx status.
#[derive(Debug, Clone, Error)]
#[error("{status}: {error}")]
pub struct Rejection {
    /// HTTP status.
    pub status: StatusCode,
    /// JSON-RPC error carried in the body.
    pub error: ErrorObject,
}

impl Rejection {
    /// Rejection with an [`ErrorCode::InvalidRequest`] body.
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            error: ErrorObject::new(ErrorCode::InvalidRequest, message),
        }
    }

    /// Rejection with a specific JSON-RPC error.
    pub fn with_error(status: StatusCode, error: ErrorObject) -> Self {
        Self { status, error }
    }

    /// The body sent to the client.
    pub fn to_message(&self) -> Message {
        Message::error(None, self.error.clone())
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        counter!(HTTP_REJECTIONS_TOTAL, "status" => self.status.as_u16().to_string()).increment(1);
        debug!(status = self.status.as_u16(), reason = %self.error.message, "request rejected");
        (self.status, Json(self.to_message())).into_response()
    }
}

impl From<TransportError> for Rejection {
    fn from(err: TransportError) -> Self {
        let status = match err {
            TransportError::Closed | TransportError::UnknownEventId(_) => StatusCode::NOT_FOUND,
            TransportError::DuplicateRequestId(_) => StatusCode::BAD_REQUEST,
            TransportError::StandaloneConflict => StatusCode::CONFLICT,
        };
        Self::new(status, err.to_string())
    }
}

/// Failures of [`StreamableHttpClient`](crate::StreamableHttpClient)
/// operations that are not tied to one request.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or protocol failure.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with an unexpected status.
    #[error("unexpected status {0}")]
    Status(u16),
    /// Outbound message could not be encoded.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display() {
        let err = ConfigError::InvalidValue("port out of range".into());
        assert_eq!(err.to_string(), "invalid config value: port out of range");
    }

    #[test]
    fn json_error_from_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad}").unwrap_err();
        let err: ConfigError = json_err.into();
        assert!(matches!(err, ConfigError::Json(_)));
    }

    #[test]
    fn transport_errors_map_to_statuses() {
        assert_eq!(Rejection::from(TransportError::Closed).status, StatusCode::NOT_FOUND);
        assert_eq!(
            Rejection::from(TransportError::UnknownEventId("7".into())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Rejection::from(TransportError::StandaloneConflict).status,
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn rejection_body_is_an_error_without_id() {
        let rejection = Rejection::new(StatusCode::BAD_REQUEST, "missing session id");
        let Message::Error(err) = rejection.to_message() else {
            panic!("expected error message");
        };
        assert!(err.id.is_none());
        assert_eq!(err.error.code, ErrorCode::InvalidRequest.as_i64());
        assert_eq!(err.error.message, "missing session id");
    }

    #[test]
    fn rejection_renders_its_status() {
        let response = Rejection::from(TransportError::DuplicateRequestId("1".into())).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
