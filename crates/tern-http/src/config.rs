//! HTTP binding configuration.
//!
//! Loading flow:
//! 1. Start with compiled [`HttpConfig::default()`]
//! 2. If a JSON config file exists, deep-merge its values over the defaults
//! 3. Apply `TERN_*` environment variable overrides (highest priority)
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::ConfigError;

/// Server-side settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Path serving `POST`/`GET`/`DELETE` (default `"/mcp"`).
    pub endpoint: String,
    /// Always answer requests with a single JSON body, never SSE.
    pub json_response: bool,
    /// Capacity of each per-request event channel.
    pub event_channel_capacity: usize,
    /// Largest accepted `POST` body in bytes.
    pub max_body_bytes: usize,
    /// Deadline for server-initiated requests, in milliseconds. `0` waits forever.
    pub request_timeout_ms: u64,
    /// Reconnect hint sent with `retry:` when a handler closes its stream
    /// without naming one, in milliseconds.
    pub retry_interval_ms: u64,
    /// Accepted protocol versions, newest first. Empty keeps the built-in list.
    pub supported_protocol_versions: Vec<String>,
    /// How long shutdown waits for open connections, in milliseconds.
    pub shutdown_timeout_ms: u64,
    /// Event store settings.
    pub event_store: EventStoreConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            endpoint: "/mcp".into(),
            json_response: false,
            event_channel_capacity: 64,
            max_body_bytes: 4 * 1024 * 1024,
            request_timeout_ms: 60_000,
            retry_interval_ms: 1_000,
            supported_protocol_versions: Vec::new(),
            shutdown_timeout_ms: 30_000,
            event_store: EventStoreConfig::default(),
        }
    }
}

impl HttpConfig {
    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Deadline for server-initiated requests.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    /// Default `retry:` hint.
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Shutdown drain timeout.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Reject settings the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.endpoint.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "endpoint must start with '/': {}",
                self.endpoint
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "eventChannelCapacity must be at least 1".into(),
            ));
        }
        if self.max_body_bytes == 0 {
            return Err(ConfigError::InvalidValue("maxBodyBytes must be at least 1".into()));
        }
        Ok(())
    }
}

/// Per-session event store settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EventStoreConfig {
    /// Give every session an in-memory event store so streams can resume.
    pub enabled: bool,
    /// Cap per stream; oldest events are evicted past it. `None` keeps all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_events_per_stream: Option<usize>,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_events_per_stream: None,
        }
    }
}

/// Client-side settings for [`StreamableHttpClient`](crate::StreamableHttpClient).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Reconnect attempts for one dropped stream before giving up.
    pub max_reconnect_attempts: u32,
    /// Delay before reconnecting when the server sent no `retry:` hint, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Open the standalone `GET` stream once a session is established.
    pub listen_standalone: bool,
    /// Per-HTTP-call timeout in milliseconds. `0` disables it; SSE responses
    /// usually need that.
    pub http_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            listen_standalone: false,
            http_timeout_ms: 0,
        }
    }
}

impl ClientConfig {
    /// Fallback reconnect delay.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load config from `path` with environment overrides.
///
/// A missing file yields the defaults; invalid JSON is an error.
pub fn load_config_from_path(path: &Path) -> Result<HttpConfig, ConfigError> {
    let defaults = serde_json::to_value(HttpConfig::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading config from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "config file not found, using defaults");
        defaults
    };

    let mut config: HttpConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `TERN_*` environment variables.
pub fn apply_env_overrides(config: &mut HttpConfig) {
    apply_overrides_from(config, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Integers must parse and fall within range; booleans accept
/// `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`. Invalid values are
/// logged and ignored.
pub fn apply_overrides_from<F>(config: &mut HttpConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("TERN_HOST") {
        config.host = v;
    }
    if let Some(v) = env.u16("TERN_PORT", 0, 65535) {
        config.port = v;
    }
    if let Some(v) = env.string("TERN_ENDPOINT") {
        config.endpoint = v;
    }
    if let Some(v) = env.bool("TERN_JSON_RESPONSE") {
        config.json_response = v;
    }
    if let Some(v) = env.usize("TERN_EVENT_CHANNEL_CAPACITY", 1, 65_536) {
        config.event_channel_capacity = v;
    }
    if let Some(v) = env.usize("TERN_MAX_BODY_BYTES", 1024, 256 * 1024 * 1024) {
        config.max_body_bytes = v;
    }
    if let Some(v) = env.u64("TERN_REQUEST_TIMEOUT_MS", 0, 3_600_000) {
        config.request_timeout_ms = v;
    }
    if let Some(v) = env.u64("TERN_RETRY_INTERVAL_MS", 0, 600_000) {
        config.retry_interval_ms = v;
    }
    if let Some(v) = env.bool("TERN_EVENT_STORE") {
        config.event_store.enabled = v;
    }
    if let Some(v) = env.usize("TERN_MAX_EVENTS_PER_STREAM", 1, 10_000_000) {
        config.event_store.max_events_per_stream = Some(v);
    }
}

/// Parse a boolean env value.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env readers ─────────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = (self.lookup)(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_u16_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_u64_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_usize_range(v, min, max))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
