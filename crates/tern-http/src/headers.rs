//! Header names and request validation helpers.

use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, StatusCode};

use crate::errors::Rejection;

/// Session id minted by `initialize` and echoed on every later call.
pub const MCP_SESSION_ID: &str = "mcp-session-id";
/// Protocol version negotiated by `initialize`.
pub const MCP_PROTOCOL_VERSION: &str = "mcp-protocol-version";
/// Last SSE event id the client saw.
pub const LAST_EVENT_ID: &str = "last-event-id";

/// `application/json`
pub const JSON: &str = "application/json";
/// `text/event-stream`
pub const EVENT_STREAM: &str = "text/event-stream";

/// String value of `name`, if present and valid ASCII.
pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn accepts(headers: &HeaderMap, media_type: &str) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|part| part.split(';').next().unwrap_or_default().trim())
        .any(|part| part.eq_ignore_ascii_case(media_type) || part == "*/*")
}

/// `POST` must accept both JSON and SSE replies.
pub fn check_post_accept(headers: &HeaderMap) -> Result<(), Rejection> {
    if accepts(headers, JSON) && accepts(headers, EVENT_STREAM) {
        Ok(())
    } else {
        Err(Rejection::new(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: client must accept both application/json and text/event-stream",
        ))
    }
}

/// `GET` must accept SSE.
pub fn check_get_accept(headers: &HeaderMap) -> Result<(), Rejection> {
    if accepts(headers, EVENT_STREAM) {
        Ok(())
    } else {
        Err(Rejection::new(
            StatusCode::NOT_ACCEPTABLE,
            "Not Acceptable: client must accept text/event-stream",
        ))
    }
}

/// `POST` bodies must be JSON.
pub fn check_content_type(headers: &HeaderMap) -> Result<(), Rejection> {
    let is_json = header_str(headers, CONTENT_TYPE.as_str())
        .and_then(|v| v.split(';').next())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case(JSON));
    if is_json {
        Ok(())
    } else {
        Err(Rejection::new(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "Unsupported Media Type: Content-Type must be application/json",
        ))
    }
}

/// A present `Mcp-Protocol-Version` must be one of `supported`.
pub fn check_protocol_version(headers: &HeaderMap, supported: &[String]) -> Result<(), Rejection> {
    match header_str(headers, MCP_PROTOCOL_VERSION) {
        Some(version) if !supported.iter().any(|s| s == version) => Err(Rejection::new(
            StatusCode::BAD_REQUEST,
            format!(
                "Bad Request: unsupported protocol version {version} (supported: {})",
                supported.join(", ")
            ),
        )),
        _ => Ok(()),
    }
}
