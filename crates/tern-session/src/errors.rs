//! Handler-side and caller-side error types.

use std::time::Duration;

use serde_json::{Value, json};
use tern_core::errors::{INTERNAL_ERROR, INVALID_PARAMS, METHOD_NOT_FOUND};
use tern_core::{ErrorObject, RequestId};

/// Error returned by a [`RequestHandler`](crate::RequestHandler).
///
/// Converted to the `error` member of the Error response written back to
/// the peer.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// Parameters were missing or malformed.
    #[error("invalid params: {message}")]
    InvalidParams {
        /// What was wrong.
        message: String,
    },

    /// The requested method is not registered.
    #[error("method not found: {method}")]
    MethodNotFound {
        /// Requested method.
        method: String,
    },

    /// The handler failed.
    #[error("internal error: {message}")]
    Internal {
        /// Failure detail (kept out of the wire message).
        message: String,
    },

    /// Application-defined error.
    #[error("[{code}] {message}")]
    Custom {
        /// Error code.
        code: i64,
        /// Error message.
        message: String,
        /// Optional structured details.
        data: Option<Value>,
    },
}

impl RpcError {
    /// Shorthand for [`RpcError::InvalidParams`].
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::InvalidParams {
            message: message.into(),
        }
    }

    /// Shorthand for [`RpcError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Numeric error code.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidParams { .. } => INVALID_PARAMS,
            Self::MethodNotFound { .. } => METHOD_NOT_FOUND,
            Self::Internal { .. } => INTERNAL_ERROR,
            Self::Custom { code, .. } => *code,
        }
    }

    /// Short label used as a metrics dimension.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidParams { .. } => "invalid_params",
            Self::MethodNotFound { .. } => "method_not_found",
            Self::Internal { .. } => "internal",
            Self::Custom { .. } => "custom",
        }
    }

    /// Wire error object.
    ///
    /// Internal failures carry the generic message; the detail goes into
    /// `data.detail`.
    pub fn to_error_object(&self) -> ErrorObject {
        match self {
            Self::InvalidParams { message } => ErrorObject::new(INVALID_PARAMS, message.clone()),
            Self::MethodNotFound { method } => {
                ErrorObject::new(METHOD_NOT_FOUND, format!("Method '{method}' not found"))
            }
            Self::Internal { message } => ErrorObject::new(INTERNAL_ERROR, "Internal error")
                .with_data(json!({ "detail": message })),
            Self::Custom {
                code,
                message,
                data,
            } => ErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
        }
    }
}

impl From<ErrorObject> for RpcError {
    fn from(err: ErrorObject) -> Self {
        Self::Custom {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::invalid_params(err.to_string())
    }
}

impl From<SessionError> for RpcError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Remote(obj) => obj.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Error returned to a caller of [`Session::send_request`](crate::Session::send_request).
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No response arrived before the deadline.
    #[error("request {id} timed out after {timeout:?}")]
    Timeout {
        /// Abandoned request.
        id: RequestId,
        /// Deadline that elapsed.
        timeout: Duration,
    },

    /// The caller cancelled the request.
    #[error("request {id} was cancelled")]
    Cancelled {
        /// Abandoned request.
        id: RequestId,
    },

    /// The session was torn down before a response arrived.
    #[error("connection closed")]
    ConnectionClosed,

    /// The peer answered with an Error response.
    #[error("remote error {0}")]
    Remote(ErrorObject),

    /// The result could not be deserialized into the expected type.
    #[error("invalid result: {0}")]
    InvalidResult(#[source] serde_json::Error),

    /// The params could not be serialized.
    #[error("invalid params: {0}")]
    InvalidParams(#[source] serde_json::Error),
}

impl SessionError {
    /// Whether this is a local timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}
