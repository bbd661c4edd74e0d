//! `HttpServer`: the streamable HTTP endpoint on axum.
//!
//! `POST` carries client messages, `GET` opens or resumes server-push
//! streams, `DELETE` ends a session. `/health` and `/metrics` sit beside
//! the endpoint.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::Bytes;
use axum::extract::rejection::BytesRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use futures::StreamExt;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use tern_core::{EventId, Message, Request, SessionId};
use tern_events::{EventStoreFactory, InMemoryEventStoreFactory};
use tern_session::{
    HandlerRegistry, Implementation, InitializeHandler, SUPPORTED_PROTOCOL_VERSIONS, SessionOptions,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::config::HttpConfig;
use crate::errors::Rejection;
use crate::headers::{
    LAST_EVENT_ID, MCP_SESSION_ID, check_content_type, check_get_accept, check_post_accept,
    check_protocol_version, header_str,
};
use crate::health::{self, HealthResponse};
use crate::metrics::{
    HTTP_JSON_RESPONSES_TOTAL, HTTP_REJECTIONS_TOTAL, HTTP_REQUESTS_TOTAL,
    HTTP_SESSIONS_CREATED_TOTAL, HTTP_SSE_STREAMS_TOTAL,
};
use crate::registry::{Negotiated, SessionRegistry, StreamSession};
use crate::shutdown::{ShutdownCoordinator, ShutdownOutcome};
use crate::sse::{Frame, frame_event};
use crate::transport::{Exchange, FrameStream, TransportOptions};

/// Method that creates a session.
pub const INITIALIZE_METHOD: &str = "initialize";

/// Shared state accessible from axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<HttpConfig>,
    /// Handlers every session's engine dispatches to.
    pub handlers: Arc<HandlerRegistry>,
    /// Live sessions.
    pub sessions: Arc<SessionRegistry>,
    /// Creates each session's event store; `None` disables resumption.
    pub store_factory: Option<Arc<dyn EventStoreFactory>>,
    /// Versions accepted in `Mcp-Protocol-Version`.
    pub supported_versions: Arc<Vec<String>>,
    /// Per-session transport tuning.
    pub transport: TransportOptions,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle behind `/metrics`.
    pub metrics: Option<PrometheusHandle>,
}

/// The streamable HTTP server.
pub struct HttpServer {
    config: Arc<HttpConfig>,
    handlers: Arc<HandlerRegistry>,
    sessions: Arc<SessionRegistry>,
    store_factory: Option<Arc<dyn EventStoreFactory>>,
    supported_versions: Arc<Vec<String>>,
    shutdown: Arc<ShutdownCoordinator>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
}

impl HttpServer {
    /// Create a server dispatching to `handlers`.
    ///
    /// An `initialize` handler negotiating the configured versions is
    /// registered unless `handlers` already has one.
    pub fn new(config: HttpConfig, mut handlers: HandlerRegistry) -> Self {
        let supported_versions: Vec<String> = if config.supported_protocol_versions.is_empty() {
            SUPPORTED_PROTOCOL_VERSIONS
                .iter()
                .map(|v| (*v).to_owned())
                .collect()
        } else {
            config.supported_protocol_versions.clone()
        };
        if !handlers.has_method(INITIALIZE_METHOD) {
            handlers.register_request(
                INITIALIZE_METHOD,
                InitializeHandler::new(Implementation::new(
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION"),
                ))
                .with_supported_versions(supported_versions.clone()),
            );
        }
        let store_factory: Option<Arc<dyn EventStoreFactory>> = if config.event_store.enabled {
            Some(match config.event_store.max_events_per_stream {
                Some(max) => Arc::new(InMemoryEventStoreFactory::with_max_events_per_stream(max)),
                None => Arc::new(InMemoryEventStoreFactory::new()),
            })
        } else {
            None
        };
        let sessions = Arc::new(SessionRegistry::new());
        let shutdown = Arc::new(ShutdownCoordinator::new(sessions.clone(), config.shutdown_timeout()));
        Self {
            config: Arc::new(config),
            handlers: Arc::new(handlers),
            sessions,
            store_factory,
            supported_versions: Arc::new(supported_versions),
            shutdown,
            start_time: Instant::now(),
            metrics: None,
        }
    }

    /// Use `factory` for per-session event stores.
    #[must_use]
    pub fn with_event_store_factory(mut self, factory: Arc<dyn EventStoreFactory>) -> Self {
        self.store_factory = Some(factory);
        self
    }

    /// Run without event stores: streams cannot be resumed and a client
    /// disconnect cancels its request.
    #[must_use]
    pub fn without_event_store(mut self) -> Self {
        self.store_factory = None;
        self
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            config: self.config.clone(),
            handlers: self.handlers.clone(),
            sessions: self.sessions.clone(),
            store_factory: self.store_factory.clone(),
            supported_versions: self.supported_versions.clone(),
            transport: TransportOptions::from(self.config.as_ref()),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route(
                &self.config.endpoint,
                get(handle_get).post(handle_post).delete(handle_delete),
            )
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Live sessions.
    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &HttpConfig {
        &self.config
    }

    /// Bind the configured address.
    pub async fn bind(&self) -> std::io::Result<TcpListener> {
        TcpListener::bind(self.config.bind_addr()).await
    }

    /// Serve on `listener` until shutdown is initiated, then close every
    /// session.
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        let app = self.router();
        info!(
            addr = ?listener.local_addr().ok(),
            endpoint = %self.config.endpoint,
            resumable = self.store_factory.is_some(),
            "http server listening"
        );
        axum::serve(listener, app)
            .with_graceful_shutdown(self.shutdown.signal())
            .await
    }

    /// Serve on `listener` in a background task.
    pub fn spawn(&self, listener: TcpListener) -> JoinHandle<()> {
        let app = self.router();
        let signal = self.shutdown.signal();
        tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(signal)
                .await;
            if let Err(e) = result {
                error!(error = %e, "http server failed");
            }
        })
    }

    /// Close every session and wait for `handles` up to the configured
    /// timeout.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) -> ShutdownOutcome {
        self.shutdown.stop(handles).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Endpoint handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST <endpoint>
async fn handle_post(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Bytes, BytesRejection>,
) -> Result<Response, Rejection> {
    counter!(HTTP_REQUESTS_TOTAL, "method" => "POST").increment(1);
    check_post_accept(&headers)?;
    check_content_type(&headers)?;
    let body = body.map_err(|e| Rejection::new(e.status(), e.body_text()))?;

    let message = match tern_core::decode(&body) {
        Ok(message) => message,
        Err(e) => {
            counter!(HTTP_REJECTIONS_TOTAL, "status" => "400").increment(1);
            debug!(error = %e, "malformed request body");
            return Ok((StatusCode::BAD_REQUEST, Json(e.to_error_response())).into_response());
        }
    };

    match message {
        Message::Request(request) if request.method == INITIALIZE_METHOD => {
            initialize(&state, &headers, request).await
        }
        message => {
            let session = lookup_session(&state, &headers)?;
            check_protocol_version(&headers, &state.supported_versions)?;
            match message {
                Message::Request(request) => exchange(&session, request).await,
                other => {
                    session.transport().deliver(other).await?;
                    Ok(StatusCode::ACCEPTED.into_response())
                }
            }
        }
    }
}

/// GET <endpoint>
async fn handle_get(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Rejection> {
    counter!(HTTP_REQUESTS_TOTAL, "method" => "GET").increment(1);
    check_get_accept(&headers)?;
    let session = lookup_session(&state, &headers)?;
    check_protocol_version(&headers, &state.supported_versions)?;

    let frames = match header_str(&headers, LAST_EVENT_ID) {
        Some(last) => session.transport().resume(&EventId::from(last)).await?,
        None => session.transport().open_standalone()?,
    };
    Ok(sse_response(frames))
}

/// DELETE <endpoint>
async fn handle_delete(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, Rejection> {
    counter!(HTTP_REQUESTS_TOTAL, "method" => "DELETE").increment(1);
    let session = lookup_session(&state, &headers)?;
    check_protocol_version(&headers, &state.supported_versions)?;
    let _ = state.sessions.remove(session.id());
    Ok(StatusCode::OK.into_response())
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.sessions.len(),
        state.shutdown.is_shutting_down(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => crate::metrics::render(handle).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn lookup_session(state: &AppState, headers: &HeaderMap) -> Result<Arc<StreamSession>, Rejection> {
    let Some(id) = header_str(headers, MCP_SESSION_ID) else {
        return Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "Bad Request: missing Mcp-Session-Id header",
        ));
    };
    state
        .sessions
        .get(id)
        .ok_or_else(|| Rejection::new(StatusCode::NOT_FOUND, "Not Found: unknown session"))
}

async fn exchange(session: &StreamSession, request: Request) -> Result<Response, Rejection> {
    match session.transport().open_exchange(request).await? {
        Exchange::Json(message) => {
            counter!(HTTP_JSON_RESPONSES_TOTAL).increment(1);
            Ok(Json(message).into_response())
        }
        Exchange::Stream(frames) => {
            counter!(HTTP_SSE_STREAMS_TOTAL).increment(1);
            Ok(sse_response(frames))
        }
    }
}

async fn initialize(
    state: &AppState,
    headers: &HeaderMap,
    request: Request,
) -> Result<Response, Rejection> {
    if header_str(headers, MCP_SESSION_ID).is_some() {
        return Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            "Bad Request: initialize must not carry Mcp-Session-Id",
        ));
    }
    if state.shutdown.is_shutting_down() {
        return Err(Rejection::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "Service Unavailable: server is shutting down",
        ));
    }

    let id = SessionId::new();
    let store = state.store_factory.as_ref().map(|factory| factory.create(&id));
    let session = Arc::new(
        StreamSession::start(
            id.clone(),
            state.handlers.clone(),
            store,
            state.transport.clone(),
            SessionOptions {
                request_timeout: state.config.request_timeout(),
                label: format!("http:{id}"),
            },
        )
        .await,
    );

    // The session is not reachable until initialize succeeds, so its output
    // is gathered here rather than streamed.
    let (buffered, terminal) = match session.transport().open_exchange(request).await? {
        Exchange::Json(message) => (None, Some(message)),
        Exchange::Stream(frames) => {
            let frames: Vec<Frame> = frames.collect().await;
            let terminal = frames.iter().find_map(|frame| match frame {
                Frame::Message { message, .. } if message.is_response() => Some(message.clone()),
                _ => None,
            });
            (Some(frames), terminal)
        }
    };

    let created = match &terminal {
        Some(Message::Error(err)) => {
            debug!(session_id = %id, code = err.error.code, "initialize failed, discarding session");
            session.close();
            false
        }
        Some(Message::Result(result)) => {
            if let Some(negotiated) = Negotiated::from_result(&result.result) {
                session.set_negotiated(negotiated);
            }
            true
        }
        _ => true,
    };
    if created {
        state.sessions.insert(session.clone());
        counter!(HTTP_SESSIONS_CREATED_TOTAL).increment(1);
        info!(
            session_id = %id,
            protocol_version = session.negotiated().map(|n| n.protocol_version).as_deref(),
            "session created"
        );
    }

    let mut response = match (buffered, terminal) {
        (Some(frames), _) => sse_response(Box::pin(futures::stream::iter(frames))),
        (None, Some(message)) => Json(message).into_response(),
        (None, None) => StatusCode::ACCEPTED.into_response(),
    };
    if created {
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            let _ = response
                .headers_mut()
                .insert(HeaderName::from_static(MCP_SESSION_ID), value);
        }
    }
    Ok(response)
}

fn sse_response(frames: FrameStream) -> Response {
    let events = frames
        .filter_map(|frame| std::future::ready(frame_event(&frame).map(Ok::<_, Infallible>)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use serde_json::{Value, json};
    use tern_session::{RpcError, handler_fn};
    use tower::ServiceExt;

    const BOTH: &str = "application/json, text/event-stream";

    fn make_server() -> HttpServer {
        let mut handlers = HandlerRegistry::default();
        handlers.register_request(
            "echo",
            handler_fn(|params, _ctx| async move { Ok::<_, RpcError>(params.unwrap_or_default()) }),
        );
        HttpServer::new(HttpConfig::default(), handlers)
    }

    fn post(body: &Value, session: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder()
            .method("POST")
            .uri("/mcp")
            .header("accept", BOTH)
            .header("content-type", "application/json");
        if let Some(session) = session {
            builder = builder.header(MCP_SESSION_ID, session);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn init_body() -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {"protocolVersion": "2025-06-18", "capabilities": {}, "clientInfo": {"name": "t", "version": "0"}}
        })
    }

    async fn body_json(resp: Response) -> Value {
        let body = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    async fn initialized(app: &Router) -> String {
        let resp = app.clone().oneshot(post(&init_body(), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        resp.headers()[MCP_SESSION_ID].to_str().unwrap().to_owned()
    }

    #[test]
    fn default_server_registers_initialize_and_store() {
        let server = make_server();
        assert!(server.handlers.has_method(INITIALIZE_METHOD));
        assert!(server.store_factory.is_some());
        assert!(server.without_event_store().store_factory.is_none());
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let app = make_server().router();
        let req = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["active_sessions"], 0);
    }

    #[tokio::test]
    async fn metrics_without_handle_is_not_found() {
        let app = make_server().router();
        let req = HttpRequest::builder().uri("/metrics").body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn initialize_creates_session() {
        let server = make_server();
        let app = server.router();
        let resp = app.clone().oneshot(post(&init_body(), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let session_id = resp.headers()[MCP_SESSION_ID].to_str().unwrap().to_owned();
        let body = body_json(resp).await;
        assert_eq!(body["result"]["protocolVersion"], "2025-06-18");

        let session = server.sessions().get(&session_id).unwrap();
        assert_eq!(session.negotiated().unwrap().protocol_version, "2025-06-18");
    }

    #[tokio::test]
    async fn failed_initialize_discards_session() {
        let server = make_server();
        let app = server.router();
        let bad = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize", "params": {}});
        let resp = app.oneshot(post(&bad, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().get(MCP_SESSION_ID).is_none());
        assert!(body_json(resp).await["error"].is_object());
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn initialize_with_session_header_is_rejected() {
        let app = make_server().router();
        let resp = app.oneshot(post(&init_body(), Some("abc"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_accept_is_406() {
        let app = make_server().router();
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/mcp")
            .header("accept", "application/json")
            .header("content-type", "application/json")
            .body(Body::from(init_body().to_string()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);
        assert!(body_json(resp).await["error"]["message"].is_string());
    }

    #[tokio::test]
    async fn wrong_content_type_is_415() {
        let app = make_server().router();
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/mcp")
            .header("accept", BOTH)
            .header("content-type", "text/plain")
            .body(Body::from(init_body().to_string()))
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn oversized_body_is_413() {
        let config = HttpConfig {
            max_body_bytes: 16,
            ..HttpConfig::default()
        };
        let app = HttpServer::new(config, HandlerRegistry::default()).router();
        let resp = app.oneshot(post(&init_body(), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn malformed_body_is_parse_error() {
        let app = make_server().router();
        let req = HttpRequest::builder()
            .method("POST")
            .uri("/mcp")
            .header("accept", BOTH)
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn missing_and_unknown_session() {
        let app = make_server().router();
        let call = json!({"jsonrpc": "2.0", "id": 2, "method": "echo", "params": {}});
        let resp = app.clone().oneshot(post(&call, None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let resp = app.oneshot(post(&call, Some("nope"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn request_without_output_is_plain_json() {
        let app = make_server().router();
        let session = initialized(&app).await;
        let call = json!({"jsonrpc": "2.0", "id": 2, "method": "echo", "params": {"a": 1}});
        let resp = app.oneshot(post(&call, Some(&session))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "application/json");
        assert_eq!(body_json(resp).await["result"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn notification_is_accepted_without_body() {
        let app = make_server().router();
        let session = initialized(&app).await;
        let note = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        let resp = app.oneshot(post(&note, Some(&session))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn unsupported_protocol_version_is_400() {
        let app = make_server().router();
        let session = initialized(&app).await;
        let call = json!({"jsonrpc": "2.0", "id": 2, "method": "echo"});
        let mut req = post(&call, Some(&session));
        let _ = req
            .headers_mut()
            .insert("mcp-protocol-version", HeaderValue::from_static("1999-01-01"));
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_with_unknown_event_id_is_404() {
        let app = make_server().router();
        let session = initialized(&app).await;
        let req = HttpRequest::builder()
            .uri("/mcp")
            .header("accept", "text/event-stream")
            .header(MCP_SESSION_ID, session.as_str())
            .header(LAST_EVENT_ID, "999999")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.oneshot(req).await.unwrap().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn second_standalone_stream_conflicts() {
        let app = make_server().router();
        let session = initialized(&app).await;
        let get = || {
            HttpRequest::builder()
                .uri("/mcp")
                .header("accept", "text/event-stream")
                .header(MCP_SESSION_ID, session.as_str())
                .body(Body::empty())
                .unwrap()
        };
        let first = app.clone().oneshot(get()).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["content-type"], "text/event-stream");
        let second = app.oneshot(get()).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        drop(first);
    }

    #[tokio::test]
    async fn delete_discards_session() {
        let server = make_server();
        let app = server.router();
        let session = initialized(&app).await;
        let req = HttpRequest::builder()
            .method("DELETE")
            .uri("/mcp")
            .header(MCP_SESSION_ID, session.as_str())
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);
        assert!(server.sessions().is_empty());

        let call = json!({"jsonrpc": "2.0", "id": 3, "method": "echo"});
        let resp = app.oneshot(post(&call, Some(&session))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn initialize_refused_while_shutting_down() {
        let server = make_server();
        let app = server.router();
        server.shutdown().shutdown();
        let resp = app.oneshot(post(&init_body(), None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
