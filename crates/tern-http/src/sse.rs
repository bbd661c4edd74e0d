//! SSE framing.
//!
//! Every JSON-RPC message travels as one `message` event whose data is the
//! encoded message. With an event store the frame also carries `id:` so the
//! client can resume from it.

use std::time::Duration;

use axum::response::sse::Event;
use tern_core::{EventId, Message};
use tracing::warn;

/// SSE event type used for every message.
pub const MESSAGE_EVENT: &str = "message";

/// One item on a per-stream channel.
#[derive(Clone, Debug)]
pub enum Frame {
    /// A message, with its event id when it was stored.
    Message {
        /// Id from the event store.
        event_id: Option<EventId>,
        /// The message.
        message: Message,
    },
    /// End the HTTP response; the client reconnects after `retry` and
    /// resumes from `event_id`.
    Close {
        /// Reconnect hint.
        retry: Duration,
        /// Last event delivered on this response, or the stream's anchor.
        event_id: Option<EventId>,
    },
}

impl Frame {
    /// Whether this frame carries a Result or Error.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Message { message, .. } if message.is_response())
    }
}

/// `id:`/`event:`/`data:` event for a message, or `None` if it cannot be
/// encoded.
pub fn message_event(event_id: Option<&EventId>, message: &Message) -> Option<Event> {
    let data = match tern_core::encode_to_string(message) {
        Ok(data) => data,
        Err(e) => {
            warn!(error = %e, "dropping message that failed to encode");
            return None;
        }
    };
    let event = Event::default().event(MESSAGE_EVENT).data(data);
    Some(match event_id {
        Some(id) => event.id(id.as_str()),
        None => event,
    })
}

/// Data-less event carrying a `retry:` hint and the resume point.
///
/// The empty `data:` line makes clients dispatch it, so they pick up the id
/// even when no message preceded it.
pub fn close_event(retry: Duration, event_id: Option<&EventId>) -> Event {
    let event = Event::default().retry(retry).data("");
    match event_id {
        Some(id) => event.id(id.as_str()),
        None => event,
    }
}

/// SSE event for a frame.
pub fn frame_event(frame: &Frame) -> Option<Event> {
    match frame {
        Frame::Message { event_id, message } => message_event(event_id.as_ref(), message),
        Frame::Close { retry, event_id } => Some(close_event(*retry, event_id.as_ref())),
    }
}
