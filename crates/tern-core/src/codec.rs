//! Wire codec: bytes ⇄ [`Message`].
//!
//! Decoding never panics. Anything that is not a well-formed JSON-RPC 2.0
//! object becomes a [`DecodeError`] carrying the standard error code, which
//! the session layer turns into an Error response.

use serde_json::{Map, Value};
use tracing::trace;

use crate::errors::{ErrorCode, ErrorObject};
use crate::message::{
    ErrorResponse, JSONRPC_VERSION, Message, Notification, Request, RequestId, ResultResponse,
};

/// Why an incoming payload could not be turned into a [`Message`].
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// Payload is not valid JSON.
    #[error("parse error: {0}")]
    Parse(String),

    /// Valid JSON, but not a valid JSON-RPC message.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Id of the offending message, when it could be read.
        id: Option<RequestId>,
        /// What was wrong.
        message: String,
    },
}

impl DecodeError {
    fn invalid(id: Option<&RequestId>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            id: id.cloned(),
            message: message.into(),
        }
    }

    /// Standard error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Parse(_) => ErrorCode::ParseError,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
        }
    }

    /// Id of the offending message, if known.
    pub fn id(&self) -> Option<&RequestId> {
        match self {
            Self::Parse(_) => None,
            Self::InvalidRequest { id, .. } => id.as_ref(),
        }
    }

    /// Error response to send back to the peer.
    pub fn to_error_response(&self) -> Message {
        let detail = match self {
            Self::Parse(msg) | Self::InvalidRequest { message: msg, .. } => msg.clone(),
        };
        Message::error(
            self.id().cloned(),
            ErrorObject::from_code(self.code()).with_data(serde_json::json!({ "detail": detail })),
        )
    }
}

/// Decode one message from raw bytes.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| {
        trace!(error = %e, "rejecting unparsable payload");
        DecodeError::Parse(e.to_string())
    })?;
    decode_value(value)
}

/// Decode one message from an already-parsed JSON value.
pub fn decode_value(value: Value) -> Result<Message, DecodeError> {
    let mut obj = match value {
        Value::Object(obj) => obj,
        Value::Array(_) => return Err(DecodeError::invalid(None, "batch requests are not supported")),
        _ => return Err(DecodeError::invalid(None, "expected a JSON object")),
    };

    let id = match obj.remove("id") {
        None | Some(Value::Null) => None,
        Some(raw) => Some(
            RequestId::from_value(&raw)
                .ok_or_else(|| DecodeError::invalid(None, "id must be an integer or a string"))?,
        ),
    };

    match obj.get("jsonrpc") {
        Some(Value::String(v)) if v == JSONRPC_VERSION => {}
        _ => return Err(DecodeError::invalid(id.as_ref(), "jsonrpc must be \"2.0\"")),
    }

    let method = match obj.remove("method") {
        None => None,
        Some(Value::String(m)) => Some(m),
        Some(_) => return Err(DecodeError::invalid(id.as_ref(), "method must be a string")),
    };

    if let Some(method) = method {
        let params = take_params(&mut obj, id.as_ref())?;
        return Ok(match id {
            Some(id) => Message::Request(Request { id, method, params }),
            None => Message::Notification(Notification { method, params }),
        });
    }

    let result = obj.remove("result");
    let error = obj.remove("error");

    match (result, error) {
        (Some(_), Some(_)) => Err(DecodeError::invalid(
            id.as_ref(),
            "response carries both result and error",
        )),
        (None, Some(error)) => {
            let error = decode_error_object(error, id.as_ref())?;
            Ok(Message::Error(ErrorResponse { id, error }))
        }
        (Some(result), None) => match id {
            Some(id) => Ok(Message::Result(ResultResponse { id, result })),
            None => Err(DecodeError::invalid(None, "result without id")),
        },
        (None, None) => Err(DecodeError::invalid(
            id.as_ref(),
            if id.is_some() { "missing method" } else { "missing method and id" },
        )),
    }
}

fn take_params(obj: &mut Map<String, Value>, id: Option<&RequestId>) -> Result<Option<Value>, DecodeError> {
    match obj.remove("params") {
        None | Some(Value::Null) => Ok(None),
        Some(p @ (Value::Object(_) | Value::Array(_))) => Ok(Some(p)),
        Some(_) => Err(DecodeError::invalid(id, "params must be an object or an array")),
    }
}

fn decode_error_object(error: Value, id: Option<&RequestId>) -> Result<ErrorObject, DecodeError> {
    let Value::Object(mut fields) = error else {
        return Err(DecodeError::invalid(id, "error must be an object"));
    };
    let code = fields
        .get("code")
        .and_then(Value::as_i64)
        .ok_or_else(|| DecodeError::invalid(id, "error.code must be an integer"))?;
    let message = match fields.remove("message") {
        Some(Value::String(m)) => m,
        _ => return Err(DecodeError::invalid(id, "error.message must be a string")),
    };
    Ok(ErrorObject {
        code,
        message,
        data: fields.remove("data"),
    })
}

/// Encode a message as JSON bytes.
pub fn encode(message: &Message) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}

/// Encode a message as a JSON string (used for SSE `data:` lines and
/// newline-delimited framing).
pub fn encode_to_string(message: &Message) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}
