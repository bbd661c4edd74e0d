//! Client side of the streamable HTTP binding.
//!
//! [`StreamableHttpClient::connect`] returns a [`DuplexChannel`] for a
//! client-side session engine. Every message the engine writes becomes its
//! own `POST`; replies (a JSON body or an SSE stream) are fed back into the
//! engine. A dropped stream is resumed with `GET` + `Last-Event-ID`.
//!
//! A request that can no longer be answered (network failure, HTTP error,
//! unexpected content type, unparsable body, exhausted reconnects) gets a
//! synthesized Error response, so the engine's caller never hangs.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use tern_core::{ErrorCode, ErrorObject, Message, RequestId};
use tern_session::{ChannelReader, ChannelWriter, DuplexChannel, SessionMessage, memory_pair};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::ClientConfig;
use crate::errors::ClientError;
use crate::headers::{EVENT_STREAM, JSON, LAST_EVENT_ID, MCP_PROTOCOL_VERSION, MCP_SESSION_ID};
use crate::metrics::{HTTP_CLIENT_RECONNECTS_TOTAL, HTTP_CLIENT_SYNTHESIZED_ERRORS_TOTAL};
use crate::server::INITIALIZE_METHOD;

const POST_ACCEPT: &str = "application/json, text/event-stream";

/// How the server answered a `POST`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Body {
    Json,
    EventStream,
    Other,
}

impl Body {
    fn of(response: &Response) -> Self {
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();
        match content_type.as_str() {
            JSON => Self::Json,
            EVENT_STREAM => Self::EventStream,
            _ => Self::Other,
        }
    }
}

/// Statuses after which resuming a stream is pointless.
fn is_fatal_resume_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::NOT_FOUND | StatusCode::METHOD_NOT_ALLOWED | StatusCode::CONFLICT
    )
}

struct ClientInner {
    http: reqwest::Client,
    endpoint: String,
    config: ClientConfig,
    session_id: RwLock<Option<String>>,
    protocol_version: RwLock<Option<String>>,
    pending_initialize: Mutex<Option<RequestId>>,
    standalone_started: AtomicBool,
    closed: CancellationToken,
}

/// HTTP client transport. Clones share the session.
#[derive(Clone)]
pub struct StreamableHttpClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for StreamableHttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamableHttpClient")
            .field("endpoint", &self.inner.endpoint)
            .field("session_id", &*self.inner.session_id.read())
            .field("protocol_version", &*self.inner.protocol_version.read())
            .finish_non_exhaustive()
    }
}

impl StreamableHttpClient {
    /// Client for `endpoint` (the full URL of the server endpoint).
    pub fn new(endpoint: impl Into<String>, config: ClientConfig) -> Result<Self, ClientError> {
        let mut builder = reqwest::Client::builder();
        if config.http_timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(config.http_timeout_ms));
        }
        Ok(Self::with_client(builder.build()?, endpoint, config))
    }

    /// Client reusing an existing `reqwest::Client`.
    pub fn with_client(http: reqwest::Client, endpoint: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                http,
                endpoint: endpoint.into(),
                config,
                session_id: RwLock::new(None),
                protocol_version: RwLock::new(None),
                pending_initialize: Mutex::new(None),
                standalone_started: AtomicBool::new(false),
                closed: CancellationToken::new(),
            }),
        }
    }

    /// Session id assigned by the server, once `initialize` succeeded.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session_id.read().clone()
    }

    /// Protocol version from the `initialize` result.
    pub fn protocol_version(&self) -> Option<String> {
        self.inner.protocol_version.read().clone()
    }

    /// Channel for a client-side session engine.
    pub fn connect(&self, capacity: usize) -> DuplexChannel {
        let (engine_end, transport_end) = memory_pair(capacity);
        let DuplexChannel { reader, writer } = transport_end;
        drop(tokio::spawn(send_outbound(self.inner.clone(), reader, writer)));
        engine_end
    }

    /// Stop sending and abandon open streams. The server session is kept;
    /// see [`terminate`](Self::terminate).
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// End the server session with `DELETE`.
    ///
    /// A server that does not allow clients to end sessions (405) or no
    /// longer knows the session (404) counts as success.
    pub async fn terminate(&self) -> Result<(), ClientError> {
        if self.session_id().is_none() {
            return Ok(());
        }
        let response = self
            .inner
            .with_session_headers(self.inner.http.delete(&self.inner.endpoint))
            .send()
            .await?;
        let status = response.status();
        if status.is_success()
            || status == StatusCode::METHOD_NOT_ALLOWED
            || status == StatusCode::NOT_FOUND
        {
            info!(status = status.as_u16(), "session terminated");
            *self.inner.session_id.write() = None;
            Ok(())
        } else {
            Err(ClientError::Status(status.as_u16()))
        }
    }
}

/// Requests are posted concurrently; notifications and responses go out
/// one at a time so the server sees them in the order they were written.
async fn send_outbound(inner: Arc<ClientInner>, mut reader: ChannelReader, inbound: ChannelWriter) {
    let (ordered, queue) = mpsc::unbounded_channel();
    drop(tokio::spawn(post_in_order(inner.clone(), queue, inbound.clone())));
    loop {
        tokio::select! {
            () = inner.closed.cancelled() => break,
            item = reader.recv() => match item {
                Some(Ok(outbound)) if matches!(outbound.message, Message::Request(_)) => {
                    let inner = inner.clone();
                    let inbound = inbound.clone();
                    drop(tokio::spawn(async move { inner.post(outbound.message, inbound).await }));
                }
                Some(Ok(outbound)) => {
                    if ordered.send(outbound.message).is_err() {
                        debug!("ordered sender gone, dropping outbound message");
                    }
                }
                Some(Err(e)) => warn!(error = %e, "engine queued a decode error outbound"),
                None => break,
            },
        }
    }
    debug!(endpoint = %inner.endpoint, "client outbound loop ended");
}

async fn post_in_order(inner: Arc<ClientInner>, mut queue: mpsc::UnboundedReceiver<Message>, inbound: ChannelWriter) {
    while let Some(message) = queue.recv().await {
        inner.clone().post(message, inbound.clone()).await;
    }
}

impl ClientInner {
    fn with_session_headers(&self, mut builder: RequestBuilder) -> RequestBuilder {
        if let Some(id) = self.session_id.read().as_deref() {
            builder = builder.header(MCP_SESSION_ID, id);
        }
        if let Some(version) = self.protocol_version.read().as_deref() {
            builder = builder.header(MCP_PROTOCOL_VERSION, version);
        }
        builder
    }

    fn record_session_id(&self, response: &Response) {
        let Some(id) = response
            .headers()
            .get(MCP_SESSION_ID)
            .and_then(|v| v.to_str().ok())
        else {
            return;
        };
        let mut current = self.session_id.write();
        if current.as_deref() != Some(id) {
            debug!(session_id = id, "session id assigned");
            *current = Some(id.to_owned());
        }
    }

    async fn post(self: Arc<Self>, message: Message, inbound: ChannelWriter) {
        let waiter = match &message {
            Message::Request(request) => {
                if request.method == INITIALIZE_METHOD {
                    *self.pending_initialize.lock() = Some(request.id.clone());
                }
                Some(request.id.clone())
            }
            _ => None,
        };
        let body = match tern_core::encode(&message) {
            Ok(body) => body,
            Err(e) => {
                self.fail(waiter, ErrorCode::InternalError, format!("failed to encode request: {e}"), "encode", &inbound)
                    .await;
                return;
            }
        };

        let request = self
            .with_session_headers(self.http.post(&self.endpoint))
            .header(ACCEPT, POST_ACCEPT)
            .header(CONTENT_TYPE, JSON)
            .body(body);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                self.fail(waiter, ErrorCode::ConnectionClosed, format!("POST failed: {e}"), "network", &inbound)
                    .await;
                return;
            }
        };
        self.record_session_id(&response);

        let status = response.status();
        if status == StatusCode::ACCEPTED {
            return;
        }
        if !status.is_success() {
            self.http_error(response, waiter, &inbound).await;
            return;
        }
        match Body::of(&response) {
            Body::Json => match response.bytes().await {
                Ok(bytes) => match tern_core::decode(&bytes) {
                    Ok(reply) => self.deliver(reply, &inbound).await,
                    Err(e) => {
                        self.fail(waiter, ErrorCode::ParseError, format!("unparsable response body: {e}"), "parse", &inbound)
                            .await;
                    }
                },
                Err(e) => {
                    self.fail(waiter, ErrorCode::ConnectionClosed, format!("failed to read response body: {e}"), "network", &inbound)
                        .await;
                }
            },
            Body::EventStream => self.consume_stream(response, waiter, &inbound).await,
            Body::Other => {
                let content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("<none>")
                    .to_owned();
                self.fail(
                    waiter,
                    ErrorCode::InternalError,
                    format!("unexpected content type: {content_type}"),
                    "content_type",
                    &inbound,
                )
                .await;
            }
        }
    }

    /// Forward a server message to the engine, noting the negotiated
    /// version first so later requests carry it.
    async fn deliver(self: &Arc<Self>, message: Message, inbound: &ChannelWriter) {
        if let Message::Result(result) = &message {
            let is_initialize = {
                let mut pending = self.pending_initialize.lock();
                if pending.as_ref() == Some(&result.id) {
                    *pending = None;
                    true
                } else {
                    false
                }
            };
            if is_initialize {
                if let Some(version) = result.result["protocolVersion"].as_str() {
                    info!(protocol_version = version, "protocol version negotiated");
                    *self.protocol_version.write() = Some(version.to_owned());
                }
                if self.config.listen_standalone && !self.standalone_started.swap(true, Ordering::AcqRel) {
                    drop(tokio::spawn(self.clone().listen_standalone(inbound.clone())));
                }
            }
        }
        trace!(method = message.method().unwrap_or("<response>"), "server message received");
        if inbound.send(SessionMessage::new(message)).await.is_err() {
            debug!("engine gone, dropping server message");
        }
    }

    async fn http_error(&self, response: Response, waiter: Option<RequestId>, inbound: &ChannelWriter) {
        let status = response.status();
        let Some(id) = waiter else {
            warn!(status = status.as_u16(), "server rejected a message");
            return;
        };
        let error = match response.bytes().await {
            Ok(bytes) => match tern_core::decode(&bytes) {
                Ok(Message::Error(err)) => Some(err.error),
                _ => None,
            },
            Err(_) => None,
        }
        .unwrap_or_else(|| ErrorObject::new(ErrorCode::InternalError, format!("HTTP {status}")));
        self.synthesize(id, error, "http_status", inbound).await;
    }

    async fn fail(
        &self,
        waiter: Option<RequestId>,
        code: ErrorCode,
        message: String,
        reason: &'static str,
        inbound: &ChannelWriter,
    ) {
        match waiter {
            Some(id) => self.synthesize(id, ErrorObject::new(code, message), reason, inbound).await,
            None => warn!(reason, error = %message, "failed to deliver message"),
        }
    }

    async fn synthesize(&self, id: RequestId, error: ErrorObject, reason: &'static str, inbound: &ChannelWriter) {
        counter!(HTTP_CLIENT_SYNTHESIZED_ERRORS_TOTAL, "reason" => reason).increment(1);
        warn!(request_id = %id, reason, code = error.code, error = %error.message, "answering request locally");
        {
            let mut pending = self.pending_initialize.lock();
            if pending.as_ref() == Some(&id) {
                *pending = None;
            }
        }
        let _ = inbound
            .send(SessionMessage::new(Message::error(Some(id), error)))
            .await;
    }

    async fn open_get(&self, last_event_id: Option<&str>) -> Result<Response, reqwest::Error> {
        let mut builder = self
            .with_session_headers(self.http.get(&self.endpoint))
            .header(ACCEPT, EVENT_STREAM);
        if let Some(last) = last_event_id {
            builder = builder.header(LAST_EVENT_ID, last);
        }
        builder.send().await
    }

    /// Read SSE events until the awaited response arrives, resuming the
    /// stream when it drops.
    async fn consume_stream(
        self: &Arc<Self>,
        mut response: Response,
        waiter: Option<RequestId>,
        inbound: &ChannelWriter,
    ) {
        let mut last_event_id: Option<String> = None;
        let mut retry = self.config.reconnect_delay();
        let mut attempts = 0u32;

        loop {
            let mut events = response.bytes_stream().eventsource();
            loop {
                let item = tokio::select! {
                    () = self.closed.cancelled() => return,
                    item = events.next() => item,
                };
                let event = match item {
                    Some(Ok(event)) => event,
                    Some(Err(e)) => {
                        debug!(error = %e, "event stream interrupted");
                        break;
                    }
                    None => break,
                };
                if let Some(hint) = event.retry {
                    retry = hint;
                }
                if !event.id.is_empty() {
                    last_event_id = Some(event.id.clone());
                    attempts = 0;
                }
                if event.data.is_empty() {
                    continue;
                }
                match tern_core::decode(event.data.as_bytes()) {
                    Ok(message) => {
                        let done = waiter.as_ref().is_some_and(|id| message.is_terminal_for(id));
                        self.deliver(message, inbound).await;
                        if done {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, event_id = %event.id, "skipping unparsable event"),
                }
            }

            let Some(resume_from) = last_event_id.clone() else {
                if let Some(id) = waiter {
                    self.synthesize(
                        id,
                        ErrorObject::new(ErrorCode::ConnectionClosed, "stream ended before the response and cannot be resumed"),
                        "unresumable",
                        inbound,
                    )
                    .await;
                }
                return;
            };

            response = loop {
                attempts += 1;
                if attempts > self.config.max_reconnect_attempts {
                    let message = format!("gave up resuming after {} attempts", attempts - 1);
                    match waiter {
                        Some(id) => {
                            self.synthesize(id, ErrorObject::new(ErrorCode::ConnectionClosed, message), "reconnect", inbound)
                                .await;
                        }
                        None => warn!(error = %message, "standalone stream lost"),
                    }
                    return;
                }
                tokio::select! {
                    () = self.closed.cancelled() => return,
                    () = tokio::time::sleep(retry) => {}
                }
                counter!(HTTP_CLIENT_RECONNECTS_TOTAL).increment(1);
                debug!(last_event_id = %resume_from, attempt = attempts, "resuming stream");
                match self.open_get(Some(&resume_from)).await {
                    Ok(next) if next.status().is_success() => break next,
                    Ok(next) if is_fatal_resume_status(next.status()) => {
                        let status = next.status();
                        match waiter {
                            Some(id) => {
                                self.synthesize(
                                    id,
                                    ErrorObject::new(ErrorCode::ConnectionClosed, format!("resume rejected with HTTP {status}")),
                                    "resume_rejected",
                                    inbound,
                                )
                                .await;
                            }
                            None => debug!(status = status.as_u16(), "standalone resume rejected"),
                        }
                        return;
                    }
                    Ok(next) => debug!(status = next.status().as_u16(), "resume attempt failed"),
                    Err(e) => debug!(error = %e, "resume attempt failed"),
                }
            };
        }
    }

    /// Keep a `GET` stream open for server messages unrelated to any
    /// request.
    ///
    /// Boxed because it is spawned from [`deliver`](Self::deliver), which
    /// it also reaches.
    fn listen_standalone(self: Arc<Self>, inbound: ChannelWriter) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let mut failures = 0u32;
            while !self.closed.is_cancelled() {
                match self.open_get(None).await {
                    Ok(response) if response.status().is_success() => {
                        failures = 0;
                        debug!("standalone stream opened");
                        self.consume_stream(response, None, &inbound).await;
                    }
                    Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                        info!("server offers no standalone stream");
                        return;
                    }
                    Ok(response) => {
                        failures += 1;
                        debug!(status = response.status().as_u16(), "standalone stream refused");
                    }
                    Err(e) => {
                        failures += 1;
                        debug!(error = %e, "standalone stream failed");
                    }
                }
                if failures > self.config.max_reconnect_attempts {
                    warn!(failures, "giving up on the standalone stream");
                    return;
                }
                tokio::select! {
                    () = self.closed.cancelled() => return,
                    () = tokio::time::sleep(self.config.reconnect_delay()) => {}
                }
            }
        })
    }
}
