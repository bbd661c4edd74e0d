//! Method registry.
//!
//! Built once at startup, wrapped in an `Arc` and handed to every
//! [`Session`]. Sessions never mutate it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tern_core::Notification;

use crate::context::RequestContext;
use crate::errors::RpcError;
use crate::session::Session;

/// Handles an inbound request.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Execute the handler. The returned value becomes the Result response.
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> Result<Value, RpcError>;
}

/// Handles an inbound notification.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    /// React to the notification. Nothing is sent back.
    async fn handle(&self, notification: Notification, session: &Session);
}

/// Registry mapping method names to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    requests: HashMap<String, Arc<dyn RequestHandler>>,
    notifications: HashMap<String, Arc<dyn NotificationHandler>>,
    fallback: Option<Arc<dyn NotificationHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a request handler for a method name.
    pub fn register_request(&mut self, method: &str, handler: impl RequestHandler + 'static) {
        let _ = self.requests.insert(method.to_owned(), Arc::new(handler));
    }

    /// Register a notification handler for a method name.
    pub fn register_notification(&mut self, method: &str, handler: impl NotificationHandler + 'static) {
        let _ = self.notifications.insert(method.to_owned(), Arc::new(handler));
    }

    /// Handler for notifications with no registered handler. Default: ignore.
    pub fn set_notification_fallback(&mut self, handler: impl NotificationHandler + 'static) {
        self.fallback = Some(Arc::new(handler));
    }

    /// Look up a request handler.
    pub fn request_handler(&self, method: &str) -> Option<Arc<dyn RequestHandler>> {
        self.requests.get(method).cloned()
    }

    /// Look up a notification handler, falling back to the fallback.
    pub fn notification_handler(&self, method: &str) -> Option<Arc<dyn NotificationHandler>> {
        self.notifications
            .get(method)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Registered request method names (sorted).
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.requests.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether a request method is registered.
    pub fn has_method(&self, method: &str) -> bool {
        self.requests.contains_key(method)
    }
}

// ── Closure adapters ────────────────────────────────────────────────

/// [`RequestHandler`] backed by an async closure. See [`handler_fn`].
pub struct FnHandler<F>(F);

/// Wrap an async closure as a request handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> RequestHandler for FnHandler<F>
where
    F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
{
    async fn handle(&self, params: Option<Value>, ctx: RequestContext) -> Result<Value, RpcError> {
        (self.0)(params, ctx).await
    }
}
