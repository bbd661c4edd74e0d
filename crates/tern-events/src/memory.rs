//! In-memory reference event store.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use parking_lot::Mutex;
use tern_core::{EventId, Message, SessionId, StreamId};
use tracing::{debug, trace};

use crate::errors::Result;
use crate::store::{EventStore, EventStoreFactory, StoredEvent};

struct Entry {
    seq: u64,
    message: Message,
}

#[derive(Default)]
struct State {
    next_seq: u64,
    streams: HashMap<StreamId, VecDeque<Entry>>,
    owners: HashMap<u64, StreamId>,
}

/// Keeps every stream's log in memory.
///
/// Event ids are decimal renderings of one counter shared by all streams of
/// the instance, so they are strictly increasing within each stream. With a
/// per-stream cap the oldest events are evicted; resuming from an evicted id
/// behaves like an unknown id.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: Mutex<State>,
    max_events_per_stream: Option<usize>,
}

impl InMemoryEventStore {
    /// Unbounded store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store keeping at most `max` events per stream (at least one).
    pub fn with_max_events_per_stream(max: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            max_events_per_stream: Some(max.max(1)),
        }
    }

    /// Total events currently retained.
    pub fn len(&self) -> usize {
        self.state.lock().owners.len()
    }

    /// Whether nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events retained for one stream.
    pub fn stream_len(&self, stream_id: &StreamId) -> usize {
        self.state
            .lock()
            .streams
            .get(stream_id)
            .map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn store_event(&self, stream_id: &StreamId, message: &Message) -> Result<EventId> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let seq = state.next_seq;

        let State {
            streams, owners, ..
        } = &mut *state;
        let log = streams.entry(stream_id.clone()).or_default();
        log.push_back(Entry {
            seq,
            message: message.clone(),
        });
        let _ = owners.insert(seq, stream_id.clone());

        if let Some(max) = self.max_events_per_stream {
            while log.len() > max {
                if let Some(evicted) = log.pop_front() {
                    let _ = owners.remove(&evicted.seq);
                    counter!("event_store_evictions_total").increment(1);
                    trace!(stream_id = %stream_id, seq = evicted.seq, "evicted oldest event");
                }
            }
        }

        counter!("event_store_events_stored_total").increment(1);
        Ok(EventId::from(seq.to_string()))
    }

    async fn replay_events_after(
        &self,
        last_event_id: &EventId,
        emit: &mut (dyn FnMut(StoredEvent) + Send),
    ) -> Result<Option<StreamId>> {
        let Ok(after) = last_event_id.parse::<u64>() else {
            debug!(%last_event_id, "replay requested for malformed event id");
            return Ok(None);
        };

        let (stream_id, events) = {
            let state = self.state.lock();
            let Some(stream_id) = state.owners.get(&after).cloned() else {
                debug!(%last_event_id, "replay requested for unknown event id");
                return Ok(None);
            };
            let events: Vec<StoredEvent> = state
                .streams
                .get(&stream_id)
                .into_iter()
                .flatten()
                .filter(|entry| entry.seq > after)
                .map(|entry| StoredEvent {
                    stream_id: stream_id.clone(),
                    event_id: EventId::from(entry.seq.to_string()),
                    message: entry.message.clone(),
                })
                .collect();
            (stream_id, events)
        };

        debug!(%last_event_id, stream_id = %stream_id, count = events.len(), "replaying events");
        for event in events {
            emit(event);
        }
        Ok(Some(stream_id))
    }
}

/// Hands each session a fresh [`InMemoryEventStore`].
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventStoreFactory {
    max_events_per_stream: Option<usize>,
}

impl InMemoryEventStoreFactory {
    /// Factory for unbounded stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory for stores capped at `max` events per stream.
    pub fn with_max_events_per_stream(max: usize) -> Self {
        Self {
            max_events_per_stream: Some(max),
        }
    }
}

impl EventStoreFactory for InMemoryEventStoreFactory {
    fn create(&self, session_id: &SessionId) -> Arc<dyn EventStore> {
        trace!(session_id = %session_id, "creating in-memory event store");
        match self.max_events_per_stream {
            Some(max) => Arc::new(InMemoryEventStore::with_max_events_per_stream(max)),
            None => Arc::new(InMemoryEventStore::new()),
        }
    }
}
