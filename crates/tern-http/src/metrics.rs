//! Prometheus metrics recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus recorder as the global `metrics` recorder.
///
/// Call once at startup before anything is recorded. Fails if another
/// recorder is already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render Prometheus text format.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric names recorded by this crate. The session engine and event store
// record their own `session_*` and `event_store_*` series.

/// HTTP requests on the endpoint (counter, labels: method).
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
/// Requests rejected before dispatch (counter, labels: status).
pub const HTTP_REJECTIONS_TOTAL: &str = "http_rejections_total";
/// Sessions created (counter).
pub const HTTP_SESSIONS_CREATED_TOTAL: &str = "http_sessions_created_total";
/// Live sessions (gauge).
pub const HTTP_SESSIONS_ACTIVE: &str = "http_sessions_active";
/// Exchanges answered with a single JSON body (counter).
pub const HTTP_JSON_RESPONSES_TOTAL: &str = "http_json_responses_total";
/// Exchanges upgraded to SSE (counter).
pub const HTTP_SSE_STREAMS_TOTAL: &str = "http_sse_streams_total";
/// Streams resumed with `Last-Event-ID` (counter).
pub const HTTP_STREAM_RESUMES_TOTAL: &str = "http_stream_resumes_total";
/// Clients that went away before their response (counter).
pub const HTTP_CLIENT_DISCONNECTS_TOTAL: &str = "http_client_disconnects_total";
/// Outbound messages with no live route (counter).
pub const HTTP_UNROUTED_MESSAGES_TOTAL: &str = "http_unrouted_messages_total";
/// Client-side synthesized error responses (counter, labels: reason).
pub const HTTP_CLIENT_SYNTHESIZED_ERRORS_TOTAL: &str = "http_client_synthesized_errors_total";
/// Client-side stream reconnects (counter).
pub const HTTP_CLIENT_RECONNECTS_TOTAL: &str = "http_client_reconnects_total";
