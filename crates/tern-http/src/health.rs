//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Number of live HTTP sessions.
    pub active_sessions: usize,
    /// Whether a shutdown is in progress.
    pub shutting_down: bool,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, sessions: usize, shutting_down: bool) -> HealthResponse {
    HealthResponse {
        status: if shutting_down { "draining" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions: sessions,
        shutting_down,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, false);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, false).uptime_secs >= 59);
    }

    #[test]
    fn sessions_tracked() {
        assert_eq!(health_check(Instant::now(), 3, false).active_sessions, 3);
    }

    #[test]
    fn draining_while_shutting_down() {
        let resp = health_check(Instant::now(), 0, true);
        assert_eq!(resp.status, "draining");
        assert!(resp.shutting_down);
    }

    #[test]
    fn serializes_to_json() {
        let json = serde_json::to_value(health_check(Instant::now(), 2, false)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["active_sessions"], 2);
    }
}
