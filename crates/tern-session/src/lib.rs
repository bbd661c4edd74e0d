//! # tern-session
//!
//! Peer-to-peer JSON-RPC session engine over an abstract duplex channel.
//!
//! - **Channels**: [`DuplexChannel`] plus in-memory and newline-delimited adapters
//! - **Session**: [`Session`] owns the pending table, id generator and the single
//!   inbound dispatch loop; every inbound request runs on its own task
//! - **Handlers**: [`HandlerRegistry`] keyed by method name, polymorphic over
//!   [`RequestHandler`] and [`NotificationHandler`]
//! - **Context**: [`RequestContext`] handed to request handlers for progress,
//!   related messages, elicitation and stream control
//! - **Lifecycle**: [`InitializeHandler`] answers `initialize` with protocol
//!   version negotiation

#![deny(unsafe_code)]

pub mod channel;
pub mod context;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod session;

pub use channel::{
    ChannelClosed, ChannelReader, ChannelWriter, DuplexChannel, Inbound, MessageMetadata,
    SessionMessage, StreamControl, channel, memory_pair, spawn_line_channel,
};
pub use context::{ElicitOutcome, RequestContext};
pub use errors::{RpcError, SessionError};
pub use lifecycle::{
    Implementation, InitializeHandler, InitializeResult, LATEST_PROTOCOL_VERSION,
    SUPPORTED_PROTOCOL_VERSIONS,
};
pub use registry::{HandlerRegistry, NotificationHandler, RequestHandler, handler_fn};
pub use session::{ProgressUpdate, RequestOptions, Session, SessionOptions};
