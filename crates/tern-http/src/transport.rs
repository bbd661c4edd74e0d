//! Per-session streamable transport.
//!
//! Sits between the HTTP handlers and one session engine. Inbound messages
//! from `POST` bodies are pushed into the engine; everything the engine
//! writes is routed by a single task to the stream it belongs to:
//!
//! - a response, or a message related to an inbound request, goes to that
//!   request's stream (one per `POST`)
//! - anything else goes to the session's standalone stream (`GET`)
//!
//! With an event store every routed message is stored first and forwarded
//! with its event id. Storing and forwarding happen under one lock that
//! resumption also takes, so a resumed stream sees the replay and then live
//! traffic with no gap and no duplicate.
//!
//! The router never waits on a response body. Each attached response has an
//! [`Outlet`] that takes frames without blocking and drains its own backlog;
//! a handler whose response is not being read is suspended on its next send
//! while every other request on the session keeps moving.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::Stream;
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::Mutex;
use serde_json::json;
use tern_core::{EventId, Message, Request, RequestId, SessionId, StreamId};
use tern_events::EventStore;
use tern_session::session::CANCELLED_NOTIFICATION;
use tern_session::{ChannelReader, ChannelWriter, DuplexChannel, SessionMessage, StreamControl, memory_pair};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, trace, warn};

use crate::config::HttpConfig;
use crate::errors::TransportError;
use crate::metrics::{HTTP_CLIENT_DISCONNECTS_TOTAL, HTTP_STREAM_RESUMES_TOTAL, HTTP_UNROUTED_MESSAGES_TOTAL};
use crate::sse::Frame;

/// Stream id of the standalone `GET` stream.
pub const STANDALONE_STREAM: &str = "_standalone";

/// Frames of one HTTP response, in emission order.
pub type FrameStream = Pin<Box<dyn Stream<Item = Frame> + Send>>;

/// How a `POST`ed request is answered.
pub enum Exchange {
    /// The handler emitted nothing before its response.
    Json(Message),
    /// The handler emitted intermediate messages; the response is a stream
    /// ending with the terminal response (or a close hint).
    Stream(FrameStream),
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(message) => f.debug_tuple("Json").field(message).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Transport tuning.
#[derive(Clone, Debug)]
pub struct TransportOptions {
    /// Capacity of each per-stream channel.
    pub capacity: usize,
    /// Never upgrade to SSE.
    pub json_response: bool,
    /// `retry:` hint when a handler closes its stream without one.
    pub default_retry: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for TransportOptions {
    fn from(config: &HttpConfig) -> Self {
        Self {
            capacity: config.event_channel_capacity.max(1),
            json_response: config.json_response,
            default_retry: config.retry_interval(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outlets
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct OutletState {
    backlog: VecDeque<Frame>,
    /// A drain task owns the backlog; set exactly while it is non-empty or
    /// about to be emptied.
    draining: bool,
}

/// Sending half of one HTTP response.
///
/// [`Outlet::push`] never waits: when the response channel is full the frame
/// is parked and a drain task feeds the backlog in order as the client reads.
/// Handlers emitting onto the stream wait in [`Outlet::ready`] instead.
struct Outlet {
    sender: mpsc::Sender<Frame>,
    capacity: usize,
    state: Mutex<OutletState>,
    room: Notify,
}

impl Outlet {
    fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let outlet = Arc::new(Self {
            sender,
            capacity,
            state: Mutex::new(OutletState::default()),
            room: Notify::new(),
        });
        (outlet, receiver)
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Queue `frame` behind everything pushed before it. Fails only when the
    /// response is gone.
    fn push(self: &Arc<Self>, frame: Frame) -> Result<(), TransportError> {
        if self.sender.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut state = self.state.lock();
        if state.draining {
            state.backlog.push_back(frame);
            return Ok(());
        }
        match self.sender.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(frame)) => {
                state.backlog.push_back(frame);
                state.draining = true;
                drop(state);
                drop(tokio::spawn(self.clone().drain()));
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    async fn drain(self: Arc<Self>) {
        loop {
            let Ok(permit) = self.sender.reserve().await else {
                let mut state = self.state.lock();
                let dropped = state.backlog.len();
                state.backlog.clear();
                state.draining = false;
                drop(state);
                trace!(dropped, "response went away with a backlog");
                self.room.notify_waiters();
                return;
            };
            let mut state = self.state.lock();
            let Some(frame) = state.backlog.pop_front() else {
                state.draining = false;
                drop(state);
                self.room.notify_waiters();
                return;
            };
            permit.send(frame);
            if state.backlog.len() < self.capacity {
                self.room.notify_waiters();
            }
        }
    }

    /// Resolves once the backlog has room, or the response is gone.
    async fn ready(&self) {
        loop {
            let notified = self.room.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock();
                if state.backlog.len() < self.capacity || self.sender.is_closed() {
                    return;
                }
            }
            notified.await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Routing state
// ─────────────────────────────────────────────────────────────────────────────

struct Route {
    outlet: Option<Arc<Outlet>>,
    generation: u64,
    /// Id of the last event handed to `outlet`; where a client resumes
    /// after a close.
    last_event_id: Option<EventId>,
}

impl Route {
    fn detached(last_event_id: Option<EventId>) -> Self {
        Self {
            outlet: None,
            generation: 0,
            last_event_id,
        }
    }
}

enum Control {
    Close { stream_id: StreamId, retry: Duration },
}

#[derive(Default)]
struct Routes {
    by_request: HashMap<RequestId, StreamId>,
    streams: HashMap<StreamId, Route>,
    next_generation: u64,
}

impl Routes {
    /// Attach `outlet` to `stream_id`, replacing any previous one.
    fn attach(
        &mut self,
        stream_id: &StreamId,
        outlet: Arc<Outlet>,
        resume_point: Option<EventId>,
    ) -> Option<u64> {
        self.next_generation += 1;
        let generation = self.next_generation;
        let route = self.streams.get_mut(stream_id)?;
        route.outlet = Some(outlet);
        route.generation = generation;
        if resume_point.is_some() {
            route.last_event_id = resume_point;
        }
        Some(generation)
    }

    fn remove_stream(&mut self, stream_id: &StreamId) {
        let _ = self.streams.remove(stream_id);
        self.by_request.retain(|_, s| s != stream_id);
    }
}

struct Shared {
    session_id: SessionId,
    store: Option<Arc<dyn EventStore>>,
    routes: Mutex<Routes>,
    store_lock: tokio::sync::Mutex<()>,
    inbound: ChannelWriter,
    control: mpsc::UnboundedSender<Control>,
    options: TransportOptions,
    standalone: StreamId,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stream an outbound message belongs to, or `None` to drop it.
    fn stream_for(&self, message: &Message, related: Option<&RequestId>) -> Option<StreamId> {
        let routes = self.routes.lock();
        match message.response_id().or(related) {
            Some(id) => routes.by_request.get(id).cloned(),
            None if message.is_response() => None,
            None => Some(self.standalone.clone()),
        }
    }

    async fn forward(&self, outbound: SessionMessage) {
        let SessionMessage { message, metadata } = outbound;
        let related = metadata.related_request_id;
        let Some(stream_id) = self.stream_for(&message, related.as_ref()) else {
            counter!(HTTP_UNROUTED_MESSAGES_TOTAL).increment(1);
            debug!(
                session_id = %self.session_id,
                method = message.method().unwrap_or("<response>"),
                "dropping message with no open route"
            );
            return;
        };
        let terminal = message.is_response();

        let _order = match &self.store {
            Some(_) => Some(self.store_lock.lock().await),
            None => None,
        };
        let event_id = match &self.store {
            Some(store) => match store.store_event(&stream_id, &message).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(session_id = %self.session_id, stream_id = %stream_id, error = %e, "failed to store event");
                    None
                }
            },
            None => None,
        };

        let outlet = {
            let mut routes = self.routes.lock();
            let outlet = routes.streams.get_mut(&stream_id).and_then(|route| {
                let outlet = route.outlet.clone()?;
                route.last_event_id.clone_from(&event_id);
                Some(outlet)
            });
            if terminal {
                routes.remove_stream(&stream_id);
            }
            outlet
        };
        let Some(outlet) = outlet else {
            trace!(
                session_id = %self.session_id,
                stream_id = %stream_id,
                stored = event_id.is_some(),
                "stream has no live receiver"
            );
            return;
        };
        if outlet.push(Frame::Message { event_id, message }).is_err() {
            debug!(session_id = %self.session_id, stream_id = %stream_id, "stream receiver went away");
            let mut routes = self.routes.lock();
            if let Some(route) = routes.streams.get_mut(&stream_id) {
                if route.outlet.as_ref().is_some_and(|current| Arc::ptr_eq(current, &outlet)) {
                    route.outlet = None;
                }
            }
        }
    }

    /// End the response attached to `stream_id` after everything already
    /// forwarded to it, telling the client where to resume.
    fn close_route(&self, stream_id: &StreamId, retry: Duration) {
        let taken = {
            let mut routes = self.routes.lock();
            routes
                .streams
                .get_mut(stream_id)
                .and_then(|route| Some((route.outlet.take()?, route.last_event_id.clone())))
        };
        let Some((outlet, event_id)) = taken else {
            trace!(session_id = %self.session_id, stream_id = %stream_id, "close requested for a stream with no receiver");
            return;
        };
        debug!(session_id = %self.session_id, stream_id = %stream_id, ?retry, "closing stream on request");
        let _ = outlet.push(Frame::Close { retry, event_id });
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut routes = self.routes.lock();
        routes.by_request.clear();
        routes.streams.retain(|id, _| *id == self.standalone);
        for route in routes.streams.values_mut() {
            route.outlet = None;
        }
        debug!(session_id = %self.session_id, "transport closed");
    }
}

/// The only task writing to streams. Queued engine output goes first, so a
/// close never overtakes messages emitted before it was requested. Nothing
/// here waits on a response being read.
async fn route_outbound(
    shared: Arc<Shared>,
    mut reader: ChannelReader,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    loop {
        tokio::select! {
            biased;
            item = reader.recv() => match item {
                Some(Ok(outbound)) => shared.forward(outbound).await,
                Some(Err(e)) => {
                    warn!(session_id = %shared.session_id, error = %e, "engine queued a decode error outbound");
                }
                None => break,
            },
            Some(command) = control.recv() => match command {
                Control::Close { stream_id, retry } => shared.close_route(&stream_id, retry),
            },
        }
    }
    shared.close();
}

// ─────────────────────────────────────────────────────────────────────────────
// Guards and stream control
// ─────────────────────────────────────────────────────────────────────────────

/// Lives as long as one HTTP response is attached to a stream.
///
/// Dropped early means the client went away: with an event store the
/// stream is detached and keeps buffering; without one the request is
/// cancelled in the engine.
struct RouteGuard {
    shared: Arc<Shared>,
    stream_id: StreamId,
    generation: u64,
    request_id: Option<RequestId>,
    discard: bool,
}

impl Drop for RouteGuard {
    fn drop(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        let mut routes = self.shared.routes.lock();
        let Some(route) = routes.streams.get_mut(&self.stream_id) else {
            return;
        };
        if route.generation != self.generation {
            return;
        }
        if self.discard {
            routes.remove_stream(&self.stream_id);
            return;
        }

        let cancel = match (&self.shared.store, &self.request_id) {
            (None, Some(request_id)) => {
                routes.remove_stream(&self.stream_id);
                request_id.clone()
            }
            _ => {
                if route.outlet.take().is_some() {
                    counter!(HTTP_CLIENT_DISCONNECTS_TOTAL).increment(1);
                    debug!(
                        session_id = %self.shared.session_id,
                        stream_id = %self.stream_id,
                        "client disconnected, stream detached"
                    );
                }
                return;
            }
        };
        drop(routes);

        counter!(HTTP_CLIENT_DISCONNECTS_TOTAL).increment(1);
        info!(session_id = %self.shared.session_id, request_id = %cancel, "client disconnected, cancelling request");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inbound = self.shared.inbound.clone();
        let notification = Message::notification(
            CANCELLED_NOTIFICATION,
            Some(json!({ "requestId": cancel.to_value(), "reason": "client disconnected" })),
        );
        drop(handle.spawn(async move {
            let _ = inbound.send(SessionMessage::new(notification)).await;
        }));
    }
}

struct RequestStreamControl {
    shared: Weak<Shared>,
    stream_id: StreamId,
}

impl StreamControl for RequestStreamControl {
    fn close_stream(&self, retry: Option<Duration>) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        if shared.store.is_none() || shared.options.json_response || shared.is_closed() {
            return false;
        }
        let retry = retry.unwrap_or(shared.options.default_retry);
        shared
            .control
            .send(Control::Close {
                stream_id: self.stream_id.clone(),
                retry,
            })
            .is_ok()
    }

    fn ready(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let outlet = {
                let Some(shared) = self.shared.upgrade() else {
                    return;
                };
                let routes = shared.routes.lock();
                routes
                    .streams
                    .get(&self.stream_id)
                    .and_then(|route| route.outlet.clone())
            };
            if let Some(outlet) = outlet {
                outlet.ready().await;
            }
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Transport
// ─────────────────────────────────────────────────────────────────────────────

/// Transport for one HTTP session. Clones share state.
#[derive(Clone)]
pub struct StreamableTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for StreamableTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableTransport")
            .field("session_id", &self.shared.session_id)
            .field("resumable", &self.shared.store.is_some())
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl StreamableTransport {
    /// Create the transport and the channel end its engine runs on.
    pub fn new(
        session_id: SessionId,
        store: Option<Arc<dyn EventStore>>,
        options: TransportOptions,
    ) -> (Self, DuplexChannel) {
        let (engine_end, transport_end) = memory_pair(options.capacity);
        let DuplexChannel { reader, writer } = transport_end;

        let (control, control_rx) = mpsc::unbounded_channel();

        let standalone = StreamId::from(STANDALONE_STREAM);
        let mut routes = Routes::default();
        let _ = routes.streams.insert(standalone.clone(), Route::detached(None));

        let shared = Arc::new(Shared {
            session_id,
            store,
            routes: Mutex::new(routes),
            store_lock: tokio::sync::Mutex::new(()),
            inbound: writer,
            control,
            options,
            standalone,
            closed: AtomicBool::new(false),
        });
        drop(tokio::spawn(route_outbound(shared.clone(), reader, control_rx)));
        (Self { shared }, engine_end)
    }

    /// Session this transport serves.
    pub fn session_id(&self) -> &SessionId {
        &self.shared.session_id
    }

    /// Whether streams can be resumed.
    pub fn is_resumable(&self) -> bool {
        self.shared.store.is_some()
    }

    /// Whether the transport has shut down.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Dispatch a request and wait for its first emitted item to decide
    /// the response shape.
    pub async fn open_exchange(&self, request: Request) -> Result<Exchange, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let request_id = request.id.clone();
        let stream_id = StreamId::new();
        let (outlet, mut rx) = Outlet::new(self.shared.options.capacity);

        let duplicate = self.shared.routes.lock().by_request.contains_key(&request_id);
        if duplicate {
            return Err(TransportError::DuplicateRequestId(request_id.to_string()));
        }
        let anchor = self.store_anchor(&stream_id, &request).await;

        let generation = {
            let mut routes = self.shared.routes.lock();
            if routes.by_request.contains_key(&request_id) {
                return Err(TransportError::DuplicateRequestId(request_id.to_string()));
            }
            let _ = routes.by_request.insert(request_id.clone(), stream_id.clone());
            let _ = routes.streams.insert(stream_id.clone(), Route::detached(anchor));
            routes.attach(&stream_id, outlet, None).unwrap_or_default()
        };
        let mut guard = RouteGuard {
            shared: self.shared.clone(),
            stream_id: stream_id.clone(),
            generation,
            request_id: Some(request_id.clone()),
            discard: false,
        };

        let control: Arc<dyn StreamControl> = Arc::new(RequestStreamControl {
            shared: Arc::downgrade(&self.shared),
            stream_id: stream_id.clone(),
        });
        let inbound = SessionMessage::new(Message::Request(request)).with_stream_control(control);
        if self.shared.inbound.send(inbound).await.is_err() {
            guard.discard = true;
            return Err(TransportError::Closed);
        }
        trace!(session_id = %self.shared.session_id, %request_id, stream_id = %stream_id, "request dispatched");

        let first = rx.recv().await.ok_or(TransportError::Closed)?;
        let first = match first {
            Frame::Message { message, .. } if message.is_response() => {
                return Ok(Exchange::Json(message));
            }
            other => other,
        };

        if self.shared.options.json_response {
            let mut frame = first;
            loop {
                if let Frame::Message { message, .. } = frame {
                    if message.is_response() {
                        return Ok(Exchange::Json(message));
                    }
                    trace!(%request_id, "json response mode, dropping intermediate message");
                }
                frame = rx.recv().await.ok_or(TransportError::Closed)?;
            }
        }

        let frames = async_stream::stream! {
            let _guard = guard;
            let mut next = Some(first);
            while let Some(frame) = next.take() {
                let end = frame.is_terminal() || matches!(frame, Frame::Close { .. });
                yield frame;
                if end {
                    break;
                }
                next = rx.recv().await;
            }
        };
        Ok(Exchange::Stream(Box::pin(frames)))
    }

    /// With a store, a request stream opens with the request itself so a
    /// close before any output still leaves the client a resume point.
    async fn store_anchor(&self, stream_id: &StreamId, request: &Request) -> Option<EventId> {
        let store = self.shared.store.as_ref()?;
        if self.shared.options.json_response {
            return None;
        }
        let _order = self.shared.store_lock.lock().await;
        match store
            .store_event(stream_id, &Message::Request(request.clone()))
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(session_id = %self.shared.session_id, stream_id = %stream_id, error = %e, "failed to store request anchor");
                None
            }
        }
    }

    /// Replay everything after `last_event_id`, then continue live on the
    /// same stream if it has not finished.
    pub async fn resume(&self, last_event_id: &EventId) -> Result<FrameStream, TransportError> {
        let unknown = || TransportError::UnknownEventId(last_event_id.to_string());
        let Some(store) = &self.shared.store else {
            return Err(unknown());
        };
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let _order = self.shared.store_lock.lock().await;
        let mut replayed = Vec::new();
        let stream_id = store
            .replay_events_after(last_event_id, &mut |event| {
                replayed.push(Frame::Message {
                    event_id: Some(event.event_id),
                    message: event.message,
                });
            })
            .await
            .map_err(|e| {
                warn!(session_id = %self.shared.session_id, %last_event_id, error = %e, "replay failed");
                unknown()
            })?
            .ok_or_else(unknown)?;

        counter!(HTTP_STREAM_RESUMES_TOTAL).increment(1);
        debug!(
            session_id = %self.shared.session_id,
            stream_id = %stream_id,
            %last_event_id,
            replayed = replayed.len(),
            "resuming stream"
        );

        let finished = replayed.iter().any(Frame::is_terminal);
        let live = if finished {
            None
        } else {
            let (outlet, rx) = Outlet::new(self.shared.options.capacity);
            let resume_point = replayed
                .iter()
                .rev()
                .find_map(|frame| match frame {
                    Frame::Message { event_id, .. } => event_id.clone(),
                    Frame::Close { .. } => None,
                })
                .unwrap_or_else(|| last_event_id.clone());
            let generation = self
                .shared
                .routes
                .lock()
                .attach(&stream_id, outlet, Some(resume_point));
            generation.map(|generation| {
                let guard = RouteGuard {
                    shared: self.shared.clone(),
                    stream_id: stream_id.clone(),
                    generation,
                    request_id: None,
                    discard: false,
                };
                (guard, rx)
            })
        };
        drop(_order);

        let frames = async_stream::stream! {
            for frame in replayed {
                let end = frame.is_terminal();
                yield frame;
                if end {
                    return;
                }
            }
            if let Some((_guard, mut rx)) = live {
                while let Some(frame) = rx.recv().await {
                    let end = frame.is_terminal() || matches!(frame, Frame::Close { .. });
                    yield frame;
                    if end {
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(frames))
    }

    /// Attach the standalone stream for messages unrelated to any request.
    pub fn open_standalone(&self) -> Result<FrameStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let (outlet, mut rx) = Outlet::new(self.shared.options.capacity);
        let generation = {
            let mut routes = self.shared.routes.lock();
            let open = routes
                .streams
                .get(&self.shared.standalone)
                .and_then(|route| route.outlet.as_ref())
                .is_some_and(|current| !current.is_closed());
            if open {
                return Err(TransportError::StandaloneConflict);
            }
            routes
                .attach(&self.shared.standalone, outlet, None)
                .ok_or(TransportError::Closed)?
        };
        let guard = RouteGuard {
            shared: self.shared.clone(),
            stream_id: self.shared.standalone.clone(),
            generation,
            request_id: None,
            discard: false,
        };
        debug!(session_id = %self.shared.session_id, "standalone stream opened");

        let frames = async_stream::stream! {
            let _guard = guard;
            while let Some(frame) = rx.recv().await {
                yield frame;
            }
        };
        Ok(Box::pin(frames))
    }

    /// Hand a client notification or response to the engine.
    pub async fn deliver(&self, message: Message) -> Result<(), TransportError> {
        self.shared
            .inbound
            .send(SessionMessage::new(message))
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// End every open stream and refuse new exchanges.
    pub fn close(&self) {
        self.shared.close();
    }
}
