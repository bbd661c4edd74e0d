//! # tern-core
//!
//! Foundation types shared by every tern crate.
//!
//! - **Messages**: [`Message`] with `Request`, `Notification`, `Result` and `Error` shapes
//! - **Codec**: [`decode`] / [`encode`] with structured [`DecodeError`]s
//! - **Errors**: JSON-RPC [`ErrorCode`]s and the wire [`ErrorObject`]
//! - **Branded IDs**: `SessionId`, `StreamId`, `EventId` newtypes
//! - **Logging**: `tracing` subscriber bootstrap

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod message;

pub use codec::{DecodeError, decode, decode_value, encode, encode_to_string};
pub use errors::{ErrorCode, ErrorObject};
pub use ids::{EventId, SessionId, StreamId};
pub use message::{
    ErrorResponse, JSONRPC_VERSION, Message, Notification, Request, RequestId, ResultResponse,
};
