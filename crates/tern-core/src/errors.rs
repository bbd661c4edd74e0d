//! JSON-RPC error codes and the wire error object.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ─────────────────────────────────────────────────────────────────────────────
// Error codes
// ─────────────────────────────────────────────────────────────────────────────

/// Invalid JSON was received.
pub const PARSE_ERROR: i64 = -32700;
/// The JSON sent is not a valid request object.
pub const INVALID_REQUEST: i64 = -32600;
/// The method does not exist or is not available.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Invalid method parameters.
pub const INVALID_PARAMS: i64 = -32602;
/// Internal error while handling the call.
pub const INTERNAL_ERROR: i64 = -32603;
/// The connection carrying the session closed.
pub const CONNECTION_CLOSED: i64 = -32000;
/// The request timed out locally.
pub const REQUEST_TIMEOUT: i64 = -32001;

/// Well-known error codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// `-32700`
    ParseError,
    /// `-32600`
    InvalidRequest,
    /// `-32601`
    MethodNotFound,
    /// `-32602`
    InvalidParams,
    /// `-32603`
    InternalError,
    /// `-32000`
    ConnectionClosed,
    /// `-32001`
    RequestTimeout,
}

impl ErrorCode {
    /// Numeric wire value.
    pub fn as_i64(self) -> i64 {
        match self {
            Self::ParseError => PARSE_ERROR,
            Self::InvalidRequest => INVALID_REQUEST,
            Self::MethodNotFound => METHOD_NOT_FOUND,
            Self::InvalidParams => INVALID_PARAMS,
            Self::InternalError => INTERNAL_ERROR,
            Self::ConnectionClosed => CONNECTION_CLOSED,
            Self::RequestTimeout => REQUEST_TIMEOUT,
        }
    }

    /// Map a numeric code back to a known variant.
    pub fn from_i64(code: i64) -> Option<Self> {
        match code {
            PARSE_ERROR => Some(Self::ParseError),
            INVALID_REQUEST => Some(Self::InvalidRequest),
            METHOD_NOT_FOUND => Some(Self::MethodNotFound),
            INVALID_PARAMS => Some(Self::InvalidParams),
            INTERNAL_ERROR => Some(Self::InternalError),
            CONNECTION_CLOSED => Some(Self::ConnectionClosed),
            REQUEST_TIMEOUT => Some(Self::RequestTimeout),
            _ => None,
        }
    }

    /// Short default message for the code.
    pub fn default_message(self) -> &'static str {
        match self {
            Self::ParseError => "Parse error",
            Self::InvalidRequest => "Invalid request",
            Self::MethodNotFound => "Method not found",
            Self::InvalidParams => "Invalid params",
            Self::InternalError => "Internal error",
            Self::ConnectionClosed => "Connection closed",
            Self::RequestTimeout => "Request timed out",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

impl From<ErrorCode> for i64 {
    fn from(code: ErrorCode) -> Self {
        code.as_i64()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Error object
// ─────────────────────────────────────────────────────────────────────────────

/// The `error` member of an Error response.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct ErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Create an error object without data.
    #[must_use]
    pub fn new(code: impl Into<i64>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Create an error object for a known code with its default message.
    #[must_use]
    pub fn from_code(code: ErrorCode) -> Self {
        Self::new(code, code.default_message())
    }

    /// Attach structured data.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Known code, if any.
    pub fn known_code(&self) -> Option<ErrorCode> {
        ErrorCode::from_i64(self.code)
    }
}
