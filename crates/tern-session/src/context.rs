//! Per-request context handed to request handlers.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tern_core::{Message, RequestId};
use tokio_util::sync::CancellationToken;

use crate::channel::{SessionMessage, StreamControl};
use crate::errors::SessionError;
use crate::session::{PROGRESS_NOTIFICATION, RequestOptions, Session};

/// Method used to ask the peer's user for structured input.
pub const ELICIT_METHOD: &str = "elicitation/create";

/// How the peer answered an elicitation.
#[derive(Clone, Debug, PartialEq)]
pub enum ElicitOutcome {
    /// The user submitted the form.
    Accepted(Value),
    /// The user explicitly declined.
    Declined,
    /// The user dismissed the prompt.
    Cancelled,
}

#[derive(Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ElicitReply {
    Accept {
        #[serde(default)]
        content: Value,
    },
    Decline,
    Cancel,
}

impl From<ElicitReply> for ElicitOutcome {
    fn from(reply: ElicitReply) -> Self {
        match reply {
            ElicitReply::Accept { content } => Self::Accepted(content),
            ElicitReply::Decline => Self::Declined,
            ElicitReply::Cancel => Self::Cancelled,
        }
    }
}

/// Everything a handler may do while serving one inbound request.
///
/// Messages sent through the context are tagged with the request's id, so a
/// streaming transport delivers them on that request's stream.
#[derive(Clone)]
pub struct RequestContext {
    session: Session,
    request_id: RequestId,
    method: String,
    cancel: CancellationToken,
    progress_token: Option<Value>,
    stream_control: Option<Arc<dyn StreamControl>>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("request_id", &self.request_id)
            .field("method", &self.method)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("progress_token", &self.progress_token)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(
        session: Session,
        request_id: RequestId,
        method: String,
        cancel: CancellationToken,
        progress_token: Option<Value>,
        stream_control: Option<Arc<dyn StreamControl>>,
    ) -> Self {
        Self {
            session,
            request_id,
            method,
            cancel,
            progress_token,
            stream_control,
        }
    }

    /// Session the request arrived on.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Id of the request being served.
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// Method of the request being served.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// Progress token supplied by the caller, if any.
    pub fn progress_token(&self) -> Option<&Value> {
        self.progress_token.as_ref()
    }

    /// Emit a progress notification. No-op when the caller did not ask for
    /// progress.
    pub async fn report_progress(
        &self,
        progress: f64,
        total: Option<f64>,
        message: Option<&str>,
    ) -> Result<(), SessionError> {
        let Some(token) = &self.progress_token else {
            return Ok(());
        };
        let mut params = json!({ "progressToken": token, "progress": progress });
        if let Some(total) = total {
            params["total"] = json!(total);
        }
        if let Some(message) = message {
            params["message"] = json!(message);
        }
        self.send_notification(PROGRESS_NOTIFICATION, Some(params))
            .await
    }

    /// Send a notification related to this request.
    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), SessionError> {
        self.stream_ready().await;
        self.session
            .send_message(SessionMessage::related(
                Message::notification(method, params),
                self.request_id.clone(),
            ))
            .await
    }

    /// Send a request to the peer on behalf of this request.
    ///
    /// Cancelling the inbound request cancels this call unless `options`
    /// carries its own token.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        mut options: RequestOptions,
    ) -> Result<Value, SessionError> {
        if options.cancel.is_none() {
            options.cancel = Some(self.cancel.child_token());
        }
        options.related_request_id = Some(self.request_id.clone());
        self.stream_ready().await;
        self.session.send_request(method, params, options).await
    }

    /// Wait for room on the stream carrying this request, or for
    /// cancellation.
    async fn stream_ready(&self) {
        if let Some(control) = &self.stream_control {
            tokio::select! {
                () = control.ready() => {}
                () = self.cancel.cancelled() => {}
            }
        }
    }

    /// Ask the peer for user input matching `requested_schema`.
    pub async fn elicit(
        &self,
        message: &str,
        requested_schema: Value,
    ) -> Result<ElicitOutcome, SessionError> {
        let result = self
            .send_request(
                ELICIT_METHOD,
                Some(json!({ "message": message, "requestedSchema": requested_schema })),
                RequestOptions::default(),
            )
            .await?;
        let reply: ElicitReply = serde_json::from_value(result).map_err(SessionError::InvalidResult)?;
        Ok(reply.into())
    }

    /// End the transport stream carrying this request while the handler
    /// keeps running; the client reconnects after `retry` and resumes.
    ///
    /// Returns `false` when the transport cannot resume (no event store, or
    /// not a streaming transport).
    pub fn close_stream(&self, retry: Option<Duration>) -> bool {
        self.stream_control
            .as_ref()
            .is_some_and(|control| control.close_stream(retry))
    }

    /// Whether the peer cancelled the request (or the session closed).
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// The request's cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}
