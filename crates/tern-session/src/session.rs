//! Session engine.
//!
//! A [`Session`] sits on one [`DuplexChannel`] and is symmetric: either side
//! may issue requests and handle them. It owns
//!
//! - a monotonic request id generator,
//! - the pending table of outbound requests awaiting a response,
//! - the in-flight table of inbound requests (for peer cancellation),
//! - the single dispatch loop reading the channel.
//!
//! Each inbound request runs on its own task so a slow handler never blocks
//! unrelated traffic. Notification handlers run one at a time, in arrival
//! order, on a per-session worker fed by the dispatch loop; they may issue
//! requests of their own because the loop keeps reading meanwhile. Outbound requests race their completion handle against
//! a deadline and an optional cancellation token; losing the race removes the
//! pending entry and tells the peer with `notifications/cancelled`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

use futures::FutureExt;
use metrics::{counter, histogram};
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tern_core::{Message, Notification, Request, RequestId};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{ChannelReader, ChannelWriter, DuplexChannel, SessionMessage, StreamControl};
use crate::context::RequestContext;
use crate::errors::{RpcError, SessionError};
use crate::registry::HandlerRegistry;

/// Method of the notification sent when a request is abandoned.
pub const CANCELLED_NOTIFICATION: &str = "notifications/cancelled";
/// Method of progress notifications.
pub const PROGRESS_NOTIFICATION: &str = "notifications/progress";
/// Liveness probe answered with `{}` unless a handler overrides it.
pub const PING_METHOD: &str = "ping";

const INITIALIZE_METHOD: &str = "initialize";

/// Default deadline for outbound requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-session settings.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Deadline applied when a request does not set its own. `None` waits forever.
    pub request_timeout: Option<Duration>,
    /// Name used in log fields.
    pub label: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
            label: "session".into(),
        }
    }
}

impl SessionOptions {
    /// Options with a log label.
    pub fn labelled(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }
}

/// One progress notification routed to a waiting caller.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressUpdate {
    /// Progress so far.
    pub progress: f64,
    /// Total, when known.
    pub total: Option<f64>,
    /// Human-readable status.
    pub message: Option<String>,
}

impl ProgressUpdate {
    fn from_params(params: &Value) -> Self {
        Self {
            progress: params.get("progress").and_then(Value::as_f64).unwrap_or_default(),
            total: params.get("total").and_then(Value::as_f64),
            message: params.get("message").and_then(Value::as_str).map(str::to_owned),
        }
    }
}

/// Per-call options for [`Session::send_request`].
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// Deadline for this call; falls back to the session default.
    pub timeout: Option<Duration>,
    /// Receives progress notifications addressed to this call.
    pub progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    /// Cancels the call when fired.
    pub cancel: Option<CancellationToken>,
    /// Inbound request this call is made on behalf of.
    pub related_request_id: Option<RequestId>,
}

impl RequestOptions {
    /// Set the deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the progress sink.
    #[must_use]
    pub fn with_progress(mut self, sink: mpsc::UnboundedSender<ProgressUpdate>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Set the cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Mark the call as related to an inbound request.
    #[must_use]
    pub fn related_to(mut self, id: RequestId) -> Self {
        self.related_request_id = Some(id);
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Session
// ─────────────────────────────────────────────────────────────────────────────

struct PendingEntry {
    tx: oneshot::Sender<Result<Value, SessionError>>,
    method: String,
    registered_at: Instant,
    progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
}

struct Inner {
    options: SessionOptions,
    registry: Arc<HandlerRegistry>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    in_flight: Mutex<HashMap<RequestId, CancellationToken>>,
    writer: Mutex<Option<ChannelWriter>>,
    closed: CancellationToken,
}

/// Handle to a running session. Clones share the same state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("label", &self.inner.options.label)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start the dispatch loop over `channel`.
    ///
    /// Returns once the loop is running, so the first message sent through
    /// the returned handle is guaranteed a reader for its response.
    pub async fn start(
        channel: DuplexChannel,
        registry: Arc<HandlerRegistry>,
        options: SessionOptions,
    ) -> Self {
        let DuplexChannel { reader, writer } = channel;
        let session = Self {
            inner: Arc::new(Inner {
                options,
                registry,
                next_id: AtomicI64::new(1),
                pending: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                writer: Mutex::new(Some(writer)),
                closed: CancellationToken::new(),
            }),
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        drop(tokio::spawn(session.clone().run(reader, ready_tx)));
        if ready_rx.await.is_err() {
            warn!(session = %session.inner.options.label, "dispatch loop exited before signalling readiness");
        }
        session
    }

    /// Handler registry shared by this session.
    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.inner.registry
    }

    /// Send a request and wait for its response.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        options: RequestOptions,
    ) -> Result<Value, SessionError> {
        if self.is_closed() {
            return Err(SessionError::ConnectionClosed);
        }
        let RequestOptions {
            timeout,
            progress,
            cancel,
            related_request_id,
        } = options;

        let id = RequestId::Number(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let params = if progress.is_some() {
            with_progress_token(params, &id)
        } else {
            params
        };

        let (tx, rx) = oneshot::channel();
        let _ = self.inner.pending.lock().insert(
            id.clone(),
            PendingEntry {
                tx,
                method: method.to_owned(),
                registered_at: Instant::now(),
                progress,
            },
        );
        let mut guard = PendingGuard {
            session: self.clone(),
            id: id.clone(),
            related: related_request_id.clone(),
            armed: true,
        };
        counter!("session_requests_sent_total", "method" => method.to_owned()).increment(1);

        let mut outbound = SessionMessage::new(Message::request(id.clone(), method, params));
        outbound.metadata.related_request_id.clone_from(&related_request_id);
        if let Err(e) = self.write(outbound).await {
            guard.armed = false;
            let _ = self.take_pending(&id);
            return Err(e);
        }

        let timeout = timeout.or(self.inner.options.request_timeout);
        let deadline = async move {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending::<()>().await,
            }
        };
        let cancel = cancel.unwrap_or_default();

        tokio::select! {
            biased;
            res = rx => {
                guard.armed = false;
                res.unwrap_or(Err(SessionError::ConnectionClosed))
            }
            () = deadline => {
                guard.armed = false;
                counter!("session_requests_timed_out_total", "method" => method.to_owned()).increment(1);
                debug!(%id, method, "request timed out");
                self.abandon(&id, "timeout", related_request_id).await;
                Err(SessionError::Timeout { id, timeout: timeout.unwrap_or_default() })
            }
            () = cancel.cancelled() => {
                guard.armed = false;
                debug!(%id, method, "request cancelled by caller");
                self.abandon(&id, "cancelled by caller", related_request_id).await;
                Err(SessionError::Cancelled { id })
            }
        }
    }

    /// Typed variant of [`send_request`](Self::send_request).
    pub async fn request<P, T>(
        &self,
        method: &str,
        params: &P,
        options: RequestOptions,
    ) -> Result<T, SessionError>
    where
        P: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let params = match serde_json::to_value(params).map_err(SessionError::InvalidParams)? {
            Value::Null => None,
            other => Some(other),
        };
        let result = self.send_request(method, params, options).await?;
        serde_json::from_value(result).map_err(SessionError::InvalidResult)
    }

    /// Fire-and-forget notification.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        self.write(SessionMessage::new(Message::notification(method, params)))
            .await
    }

    /// Write an arbitrary message with its metadata.
    pub async fn send_message(&self, message: SessionMessage) -> Result<(), SessionError> {
        self.write(message).await
    }

    /// Tear the session down: close the write side, fail every pending
    /// request with [`SessionError::ConnectionClosed`], cancel in-flight
    /// handlers and stop the dispatch loop.
    pub fn close(&self) {
        self.shutdown("closed locally");
    }

    /// Wait until the session has shut down.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await;
    }

    /// Whether the session has shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Outbound requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Inbound requests whose handlers are still running.
    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    // ── Internals ───────────────────────────────────────────────────

    async fn write(&self, message: SessionMessage) -> Result<(), SessionError> {
        let writer: Option<ChannelWriter> = self.inner.writer.lock().clone();
        let Some(writer) = writer else {
            return Err(SessionError::ConnectionClosed);
        };
        writer
            .send(message)
            .await
            .map_err(|_| SessionError::ConnectionClosed)
    }

    fn take_pending(&self, id: &RequestId) -> Option<PendingEntry> {
        self.inner.pending.lock().remove(id)
    }

    /// Drop a pending entry that lost its race and tell the peer.
    async fn abandon(&self, id: &RequestId, reason: &str, related: Option<RequestId>) {
        let Some(entry) = self.take_pending(id) else {
            return;
        };
        if entry.method != INITIALIZE_METHOD {
            self.notify_cancelled(id, reason, related).await;
        }
    }

    async fn notify_cancelled(&self, id: &RequestId, reason: &str, related: Option<RequestId>) {
        let mut message = SessionMessage::new(Message::notification(
            CANCELLED_NOTIFICATION,
            Some(json!({ "requestId": id.to_value(), "reason": reason })),
        ));
        message.metadata.related_request_id = related;
        if let Err(e) = self.write(message).await {
            debug!(%id, error = %e, "could not send cancellation");
        }
    }

    async fn run(self, mut reader: ChannelReader, ready: oneshot::Sender<()>) {
        let (notifications, queue) = mpsc::unbounded_channel();
        drop(tokio::spawn(self.clone().run_notifications(queue)));
        let _ = ready.send(());
        debug!(session = %self.inner.options.label, "dispatch loop running");

        loop {
            let item = tokio::select! {
                () = self.inner.closed.cancelled() => break,
                item = reader.recv() => item,
            };
            match item {
                Some(Ok(message)) => self.dispatch(message, &notifications),
                Some(Err(err)) => {
                    counter!("session_decode_errors_total").increment(1);
                    warn!(session = %self.inner.options.label, error = %err, "answering undecodable message");
                    if let Err(e) = self.write(SessionMessage::new(err.to_error_response())).await {
                        debug!(error = %e, "could not answer undecodable message");
                    }
                }
                None => break,
            }
        }

        self.shutdown("channel closed");
    }

    fn dispatch(&self, inbound: SessionMessage, notifications: &mpsc::UnboundedSender<Notification>) {
        let SessionMessage { message, metadata } = inbound;
        match message {
            Message::Request(request) => self.spawn_handler(request, metadata.stream_control),
            Message::Notification(notification) => self.handle_notification(notification, notifications),
            Message::Result(response) => self.deliver(response.id, Ok(response.result)),
            Message::Error(response) => match response.id {
                Some(id) => self.deliver(id, Err(SessionError::Remote(response.error))),
                None => warn!(
                    code = response.error.code,
                    message = %response.error.message,
                    "peer reported an error without a request id"
                ),
            },
        }
    }

    fn deliver(&self, id: RequestId, outcome: Result<Value, SessionError>) {
        let Some(entry) = self.take_pending(&id) else {
            counter!("session_stray_responses_total").increment(1);
            warn!(%id, "discarding response for unknown request id");
            return;
        };
        histogram!("session_request_duration_seconds", "method" => entry.method.clone())
            .record(entry.registered_at.elapsed().as_secs_f64());
        let _ = entry.tx.send(outcome);
    }

    fn handle_notification(&self, notification: Notification, queue: &mpsc::UnboundedSender<Notification>) {
        match notification.method.as_str() {
            CANCELLED_NOTIFICATION => self.cancel_inbound(notification.params.as_ref()),
            PROGRESS_NOTIFICATION => self.forward_progress(notification.params.as_ref()),
            _ => {
                if self.inner.registry.notification_handler(&notification.method).is_none() {
                    trace!(method = %notification.method, "no handler for notification");
                    return;
                }
                if queue.send(notification).is_err() {
                    debug!("notification worker gone, dropping notification");
                }
            }
        }
    }

    /// Runs notification handlers sequentially until the dispatch loop ends
    /// or the session closes.
    async fn run_notifications(self, mut queue: mpsc::UnboundedReceiver<Notification>) {
        loop {
            let notification = tokio::select! {
                () = self.inner.closed.cancelled() => break,
                notification = queue.recv() => notification,
            };
            let Some(notification) = notification else {
                break;
            };
            let Some(handler) = self.inner.registry.notification_handler(&notification.method) else {
                continue;
            };
            let method = notification.method.clone();
            let outcome = AssertUnwindSafe(handler.handle(notification, &self))
                .catch_unwind()
                .await;
            if let Err(panic) = outcome {
                error!(method, detail = panic_message(&*panic), "notification handler panicked");
            }
        }
        trace!(session = %self.inner.options.label, "notification worker stopped");
    }

    fn cancel_inbound(&self, params: Option<&Value>) {
        let Some(id) = params
            .and_then(|p| p.get("requestId"))
            .and_then(RequestId::from_value)
        else {
            debug!("ignoring cancellation without requestId");
            return;
        };
        let token = self.inner.in_flight.lock().get(&id).cloned();
        match token {
            Some(token) => {
                let reason = params
                    .and_then(|p| p.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified");
                debug!(%id, reason, "peer cancelled in-flight request");
                token.cancel();
            }
            None => debug!(%id, "cancellation for unknown or finished request"),
        }
    }

    fn forward_progress(&self, params: Option<&Value>) {
        let Some(params) = params else {
            return;
        };
        let Some(token) = params.get("progressToken").and_then(RequestId::from_value) else {
            return;
        };
        let sink = self
            .inner
            .pending
            .lock()
            .get(&token)
            .and_then(|entry| entry.progress.clone());
        match sink {
            Some(sink) => {
                let _ = sink.send(ProgressUpdate::from_params(params));
            }
            None => trace!(%token, "dropping progress for unknown token"),
        }
    }

    fn spawn_handler(&self, request: Request, stream_control: Option<Arc<dyn StreamControl>>) {
        let Request { id, method, params } = request;
        counter!("session_requests_received_total", "method" => method.clone()).increment(1);

        let token = self.inner.closed.child_token();
        if self
            .inner
            .in_flight
            .lock()
            .insert(id.clone(), token.clone())
            .is_some()
        {
            warn!(%id, "peer reused an in-flight request id");
        }

        let progress_token = params
            .as_ref()
            .and_then(|p| p.get("_meta"))
            .and_then(|m| m.get("progressToken"))
            .cloned();
        let ctx = RequestContext::new(
            self.clone(),
            id.clone(),
            method.clone(),
            token.clone(),
            progress_token,
            stream_control,
        );

        let session = self.clone();
        drop(tokio::spawn(async move {
            let start = Instant::now();
            let result = session.run_handler(&method, params, ctx).await;
            let _ = session.inner.in_flight.lock().remove(&id);
            histogram!("session_handler_duration_seconds", "method" => method.clone())
                .record(start.elapsed().as_secs_f64());

            if token.is_cancelled() {
                debug!(%id, method, "request cancelled, response suppressed");
                return;
            }
            let response = match result {
                Ok(value) => Message::result(id.clone(), value),
                Err(err) => {
                    counter!(
                        "session_handler_errors_total",
                        "method" => method.clone(),
                        "error_type" => err.kind()
                    )
                    .increment(1);
                    debug!(%id, method, error = %err, "handler returned an error");
                    Message::error(Some(id.clone()), err.to_error_object())
                }
            };
            if let Err(e) = session.write(SessionMessage::related(response, id)).await {
                debug!(method, error = %e, "could not write response");
            }
        }));
    }

    /// Run the handler to completion. Cancellation is cooperative: the
    /// handler observes its token and the caller decides whether to answer.
    async fn run_handler(
        &self,
        method: &str,
        params: Option<Value>,
        ctx: RequestContext,
    ) -> Result<Value, RpcError> {
        let Some(handler) = self.inner.registry.request_handler(method) else {
            return if method == PING_METHOD {
                Ok(json!({}))
            } else {
                Err(RpcError::MethodNotFound {
                    method: method.to_owned(),
                })
            };
        };

        AssertUnwindSafe(handler.handle(params, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                let detail = panic_message(&*panic);
                error!(method, detail, "request handler panicked");
                Err(RpcError::internal(format!("handler panicked: {detail}")))
            })
    }

    fn shutdown(&self, reason: &str) {
        let writer = self.inner.writer.lock().take();
        let first = writer.is_some();
        drop(writer);

        let drained: Vec<PendingEntry> = self
            .inner
            .pending
            .lock()
            .drain()
            .map(|(_, entry)| entry)
            .collect();
        let failed = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(SessionError::ConnectionClosed));
        }

        self.inner.closed.cancel();
        if first {
            info!(session = %self.inner.options.label, reason, failed_pending = failed, "session closed");
        }
    }
}

/// Removes the pending entry (and tells the peer) when a `send_request`
/// future is dropped before resolving.
struct PendingGuard {
    session: Session,
    id: RequestId,
    related: Option<RequestId>,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let Some(entry) = self.session.take_pending(&self.id) else {
            return;
        };
        if entry.method == INITIALIZE_METHOD {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let session = self.session.clone();
        let id = self.id.clone();
        let related = self.related.take();
        drop(handle.spawn(async move {
            session.notify_cancelled(&id, "request dropped", related).await;
        }));
    }
}

fn with_progress_token(params: Option<Value>, id: &RequestId) -> Option<Value> {
    let mut params = params.unwrap_or_else(|| json!({}));
    if let Value::Object(map) = &mut params {
        let meta = map.entry("_meta").or_insert_with(|| json!({}));
        if let Value::Object(meta) = meta {
            let _ = meta.insert("progressToken".into(), id.to_value());
        }
    }
    Some(params)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
