//! Server shutdown.
//!
//! Open SSE responses keep their connections busy, so the listener can only
//! drain once the sessions feeding those responses are closed. The
//! [`ShutdownCoordinator`] ties the two together: firing its token refuses
//! new sessions, closes every live one, and then gives the listener and any
//! background tasks a bounded time to finish.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::registry::SessionRegistry;

/// How [`ShutdownCoordinator::stop`] ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every tracked task finished in time.
    Drained,
    /// The timeout elapsed with tasks still running.
    TimedOut,
}

/// Owns the server's shutdown token and the sessions it ends.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    sessions: Arc<SessionRegistry>,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Coordinator closing `sessions`, waiting at most `timeout` for tasks.
    pub fn new(sessions: Arc<SessionRegistry>, timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            sessions,
            timeout,
        }
    }

    /// Clone of the shutdown token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Whether new sessions are being refused.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Refuse new sessions and close every live one. Idempotent.
    pub fn shutdown(&self) {
        if !self.token.is_cancelled() {
            info!(sessions = self.sessions.len(), "shutdown initiated");
        }
        self.token.cancel();
        self.sessions.close_all();
    }

    /// Future for axum's graceful shutdown: resolves once the token fires,
    /// however it was fired, after closing every session.
    pub fn signal(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.token.clone();
        let sessions = self.sessions.clone();
        async move {
            token.cancelled().await;
            sessions.close_all();
        }
    }

    /// Shut down, then wait for `handles` up to the configured timeout.
    pub async fn stop(&self, handles: Vec<JoinHandle<()>>) -> ShutdownOutcome {
        self.shutdown();
        if handles.is_empty() {
            return ShutdownOutcome::Drained;
        }
        let count = handles.len();
        match tokio::time::timeout(self.timeout, futures::future::join_all(handles)).await {
            Ok(_) => {
                info!(task_count = count, "server tasks drained");
                ShutdownOutcome::Drained
            }
            Err(_) => {
                warn!(task_count = count, timeout = ?self.timeout, "shutdown timed out with tasks still running");
                ShutdownOutcome::TimedOut
            }
        }
    }
}
