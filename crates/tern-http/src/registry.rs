//! Live HTTP sessions.
//!
//! A [`StreamSession`] pairs one [`StreamableTransport`] with the session
//! engine running on it. The [`SessionRegistry`] is the only state shared
//! across sessions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use metrics::gauge;
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::Value;
use tern_core::SessionId;
use tern_events::EventStore;
use tern_session::{HandlerRegistry, Session, SessionOptions};
use tracing::{debug, info};

use crate::metrics::HTTP_SESSIONS_ACTIVE;
use crate::transport::{StreamableTransport, TransportOptions};

/// What `initialize` settled on.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Negotiated {
    /// Protocol version both sides speak.
    pub protocol_version: String,
    /// Capabilities the server advertised.
    #[serde(default)]
    pub capabilities: Value,
}

impl Negotiated {
    /// Read from an `initialize` result; `None` if it has no version.
    pub fn from_result(result: &Value) -> Option<Self> {
        serde_json::from_value(result.clone()).ok()
    }
}

/// One HTTP session: transport, engine, and negotiated state.
pub struct StreamSession {
    id: SessionId,
    transport: StreamableTransport,
    engine: Session,
    negotiated: RwLock<Option<Negotiated>>,
    created_at: Instant,
}

impl std::fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSession")
            .field("id", &self.id)
            .field("negotiated", &*self.negotiated.read())
            .field("transport", &self.transport)
            .finish_non_exhaustive()
    }
}

impl StreamSession {
    /// Create the transport and start an engine on it.
    pub async fn start(
        id: SessionId,
        handlers: Arc<HandlerRegistry>,
        store: Option<Arc<dyn EventStore>>,
        options: TransportOptions,
        session_options: SessionOptions,
    ) -> Self {
        let (transport, channel) = StreamableTransport::new(id.clone(), store, options);
        let engine = Session::start(channel, handlers, session_options).await;
        debug!(session_id = %id, resumable = transport.is_resumable(), "session started");
        Self {
            id,
            transport,
            engine,
            negotiated: RwLock::new(None),
            created_at: Instant::now(),
        }
    }

    /// Session id (the `Mcp-Session-Id` value).
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Per-session transport.
    pub fn transport(&self) -> &StreamableTransport {
        &self.transport
    }

    /// Per-session engine.
    pub fn engine(&self) -> &Session {
        &self.engine
    }

    /// Negotiated version and capabilities, once `initialize` succeeded.
    pub fn negotiated(&self) -> Option<Negotiated> {
        self.negotiated.read().clone()
    }

    /// Record the outcome of `initialize`.
    pub fn set_negotiated(&self, negotiated: Negotiated) {
        *self.negotiated.write() = Some(negotiated);
    }

    /// When the session was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// End open streams and stop the engine. Pending and in-flight work
    /// is abandoned.
    pub fn close(&self) {
        self.transport.close();
        self.engine.close();
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sessions by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<StreamSession>>>,
}

impl SessionRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session.
    pub fn insert(&self, session: Arc<StreamSession>) {
        let count = {
            let mut sessions = self.sessions.write();
            let _ = sessions.insert(session.id().clone(), session);
            sessions.len()
        };
        record_active(count);
    }

    /// Look up a session by its header value.
    pub fn get(&self, id: &str) -> Option<Arc<StreamSession>> {
        self.sessions.read().get(&SessionId::from(id)).cloned()
    }

    /// Remove and close a session. Returns it if it existed.
    pub fn remove(&self, id: &str) -> Option<Arc<StreamSession>> {
        let (removed, count) = {
            let mut sessions = self.sessions.write();
            let removed = sessions.remove(&SessionId::from(id));
            (removed, sessions.len())
        };
        let session = removed?;
        session.close();
        record_active(count);
        info!(session_id = %session.id(), "session terminated");
        Some(session)
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// Close and forget every session.
    pub fn close_all(&self) {
        let drained: Vec<_> = self.sessions.write().drain().map(|(_, s)| s).collect();
        for session in &drained {
            session.close();
        }
        record_active(0);
        if !drained.is_empty() {
            info!(count = drained.len(), "closed all sessions");
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn record_active(count: usize) {
    gauge!(HTTP_SESSIONS_ACTIVE).set(count as f64);
}
