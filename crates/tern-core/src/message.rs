//! JSON-RPC 2.0 message shapes.
//!
//! A [`Message`] is one of four variants. Serialization always emits the
//! `"jsonrpc": "2.0"` member; deserialization goes through
//! [`decode_value`](crate::codec::decode_value) so malformed input yields a
//! structured [`DecodeError`](crate::codec::DecodeError) instead of a generic
//! serde failure.

use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::ErrorObject;

/// Protocol version string carried in every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// Correlation id linking a request to its response.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    /// Integer id.
    Number(i64),
    /// String id.
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self::Number(i64::from(n))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl RequestId {
    /// JSON representation (used as a progress token).
    pub fn to_value(&self) -> Value {
        match self {
            Self::Number(n) => Value::from(*n),
            Self::String(s) => Value::from(s.as_str()),
        }
    }

    /// Parse a JSON value as a request id.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

/// A call expecting exactly one response.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    /// Correlation id.
    pub id: RequestId,
    /// Method name.
    pub method: String,
    /// Optional parameters (object or array).
    pub params: Option<Value>,
}

/// A one-way message; never answered.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    /// Method name.
    pub method: String,
    /// Optional parameters (object or array).
    pub params: Option<Value>,
}

/// Successful response.
#[derive(Clone, Debug, PartialEq)]
pub struct ResultResponse {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Result payload.
    pub result: Value,
}

/// Failed response.
///
/// `id` is `None` only when the failing request could not be identified
/// (parse errors); it serializes as `null`.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorResponse {
    /// Id of the request being answered, if known.
    pub id: Option<RequestId>,
    /// Error details.
    pub error: ErrorObject,
}

/// Any JSON-RPC message.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Request.
    Request(Request),
    /// Notification.
    Notification(Notification),
    /// Result response.
    Result(ResultResponse),
    /// Error response.
    Error(ErrorResponse),
}

impl Message {
    /// Build a request.
    pub fn request(id: impl Into<RequestId>, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id: id.into(),
            method: method.into(),
            params,
        })
    }

    /// Build a notification.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    /// Build a result response.
    pub fn result(id: impl Into<RequestId>, result: Value) -> Self {
        Self::Result(ResultResponse {
            id: id.into(),
            result,
        })
    }

    /// Build an error response.
    pub fn error(id: Option<RequestId>, error: ErrorObject) -> Self {
        Self::Error(ErrorResponse { id, error })
    }

    /// Method name for requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(r) => Some(&r.method),
            Self::Notification(n) => Some(&n.method),
            Self::Result(_) | Self::Error(_) => None,
        }
    }

    /// Whether this is a Result or Error.
    pub fn is_response(&self) -> bool {
        matches!(self, Self::Result(_) | Self::Error(_))
    }

    /// Id of the request this response answers.
    pub fn response_id(&self) -> Option<&RequestId> {
        match self {
            Self::Result(r) => Some(&r.id),
            Self::Error(e) => e.id.as_ref(),
            Self::Request(_) | Self::Notification(_) => None,
        }
    }

    /// Whether this is the terminal response for `id`.
    pub fn is_terminal_for(&self, id: &RequestId) -> bool {
        self.response_id() == Some(id)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Serde
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct WireRequest<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireNotification<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a Value>,
}

#[derive(Serialize)]
struct WireResult<'a> {
    jsonrpc: &'static str,
    id: &'a RequestId,
    result: &'a Value,
}

#[derive(Serialize)]
struct WireError<'a> {
    jsonrpc: &'static str,
    id: Option<&'a RequestId>,
    error: &'a ErrorObject,
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Request(r) => WireRequest {
                jsonrpc: JSONRPC_VERSION,
                id: &r.id,
                method: &r.method,
                params: r.params.as_ref(),
            }
            .serialize(serializer),
            Self::Notification(n) => WireNotification {
                jsonrpc: JSONRPC_VERSION,
                method: &n.method,
                params: n.params.as_ref(),
            }
            .serialize(serializer),
            Self::Result(r) => WireResult {
                jsonrpc: JSONRPC_VERSION,
                id: &r.id,
                result: &r.result,
            }
            .serialize(serializer),
            Self::Error(e) => WireError {
                jsonrpc: JSONRPC_VERSION,
                id: e.id.as_ref(),
                error: &e.error,
            }
            .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        crate::codec::decode_value(value).map_err(D::Error::custom)
    }
}
