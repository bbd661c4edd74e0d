//! Event store contract.
//!
//! A stream is the ordered sequence of messages emitted for one request (or
//! for a session's standalone stream). Each stored message gets an event id
//! that is strictly greater than every earlier id of the same stream, and
//! that id is what clients echo in `Last-Event-ID` to resume.

use std::sync::Arc;

use async_trait::async_trait;
use tern_core::{EventId, Message, SessionId, StreamId};

use crate::errors::Result;

/// One persisted message.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredEvent {
    /// Stream the event belongs to.
    pub stream_id: StreamId,
    /// Id assigned when the event was stored.
    pub event_id: EventId,
    /// The message itself.
    pub message: Message,
}

/// Persistence for resumable streams.
///
/// Implementations must keep per-stream emission order and must answer an
/// unknown (never issued, or evicted) event id with `Ok(None)`.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append `message` to `stream_id`'s log and return its fresh id.
    async fn store_event(&self, stream_id: &StreamId, message: &Message) -> Result<EventId>;

    /// Call `emit` once per event stored after `last_event_id` on the stream
    /// that owns it, in order, and return that stream's id.
    ///
    /// Returns `Ok(None)` when `last_event_id` is unknown; the client must
    /// re-issue its request instead of resuming.
    async fn replay_events_after(
        &self,
        last_event_id: &EventId,
        emit: &mut (dyn FnMut(StoredEvent) + Send),
    ) -> Result<Option<StreamId>>;
}

/// Produces one [`EventStore`] per HTTP session.
pub trait EventStoreFactory: Send + Sync {
    /// Store for a newly created session.
    fn create(&self, session_id: &SessionId) -> Arc<dyn EventStore>;
}

impl<F> EventStoreFactory for F
where
    F: Fn(&SessionId) -> Arc<dyn EventStore> + Send + Sync,
{
    fn create(&self, session_id: &SessionId) -> Arc<dyn EventStore> {
        self(session_id)
    }
}
