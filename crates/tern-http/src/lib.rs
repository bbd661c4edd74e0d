//! # tern-http
//!
//! Streamable HTTP binding for tern sessions.
//!
//! - **Server**: [`HttpServer`] on axum; `POST` answers a request with one JSON
//!   body or upgrades it to an SSE stream, `GET` resumes a stream or opens the
//!   standalone stream, `DELETE` ends a session
//! - **Sessions**: [`SessionRegistry`] of [`StreamSession`]s, each a
//!   [`StreamableTransport`] paired with its own session engine
//! - **Resumption**: per-session event stores; `Last-Event-ID` replays and
//!   continues live without gaps or duplicates
//! - **Client**: [`StreamableHttpClient`] exposes a duplex channel for a
//!   client-side engine and reconnects dropped streams
//! - Config with env overrides, `/health`, Prometheus `/metrics`, graceful
//!   shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod client;
pub mod config;
pub mod errors;
pub mod headers;
pub mod health;
pub mod metrics;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod sse;
pub mod transport;

pub use client::StreamableHttpClient;
pub use config::{ClientConfig, EventStoreConfig, HttpConfig, load_config_from_path};
pub use errors::{ClientError, ConfigError, Rejection, TransportError};
pub use registry::{Negotiated, SessionRegistry, StreamSession};
pub use server::{AppState, HttpServer};
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome};
pub use transport::{Exchange, StreamableTransport, TransportOptions};
