//! Middleware and event-handler dispatch.
//!
//! Per inbound event: middlewares run strictly in registration order, then
//! every handler registered for the event name, with first-responder-wins
//! short-circuiting throughout. Errors are contained at this boundary and
//! converted to code-500 replies; nothing propagates to the transport.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::envelope::{MessageBody, codes};
use crate::errors::HandlerError;
use crate::ids::{FetchId, PeerId};
use crate::reply::Replier;

/// Everything a middleware or handler sees about one inbound event.
#[derive(Clone, Debug)]
pub struct EventContext {
    /// The event name.
    pub event: String,
    /// The payload.
    pub body: MessageBody,
    /// Sender identity; `None` on the initiating side, where the only peer
    /// is the hub itself.
    pub peer_id: Option<PeerId>,
    /// Correlation id, present iff the sender awaits a reply.
    pub fetch_id: Option<FetchId>,
    /// Envelope header metadata.
    pub header: HashMap<String, String>,
}

/// One middleware or event handler.
///
/// Returning `Err` aborts the chain and, if a reply is still owed, sends a
/// code-500 reply in its place.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process the event. Reply at most once through `reply`.
    async fn handle(&self, ctx: &EventContext, reply: &Replier) -> Result<(), HandlerError>;
}

/// Ordered middleware chain plus per-event handler lists.
///
/// Registration is interior-mutable so endpoints can add handlers after
/// they start accepting traffic; dispatch snapshots the chain first and is
/// unaffected by concurrent registration.
#[derive(Default)]
pub struct Pipeline {
    middlewares: RwLock<Vec<Arc<dyn EventHandler>>>,
    handlers: RwLock<HashMap<String, Vec<Arc<dyn EventHandler>>>>,
}

impl Pipeline {
    /// Create an empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a middleware. Middlewares run before any handler, in the
    /// order they were added.
    pub fn use_middleware(&self, middleware: impl EventHandler + 'static) {
        self.middlewares.write().push(Arc::new(middleware));
    }

    /// Register a handler for an event name. Multiple handlers for the same
    /// name run in registration order until one replies.
    pub fn on(&self, event: impl Into<String>, handler: impl EventHandler + 'static) {
        self.handlers
            .write()
            .entry(event.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Whether any handler is registered for `event`.
    #[must_use]
    pub fn has_handler(&self, event: &str) -> bool {
        self.handlers.read().contains_key(event)
    }

    /// Registered middleware count.
    #[must_use]
    pub fn middleware_count(&self) -> usize {
        self.middlewares.read().len()
    }

    /// Run the full chain for one inbound event.
    pub async fn dispatch(&self, ctx: &EventContext, reply: &Replier) {
        let middlewares: Vec<Arc<dyn EventHandler>> = self.middlewares.read().clone();
        for middleware in middlewares {
            if reply.has_replied() {
                return;
            }
            if let Err(error) = middleware.handle(ctx, reply).await {
                warn!(event = %ctx.event, %error, "middleware failed");
                reply.reply_with(Value::Null, codes::HANDLER_ERROR, "middleware error");
                return;
            }
        }

        let handlers: Vec<Arc<dyn EventHandler>> = self
            .handlers
            .read()
            .get(&ctx.event)
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            if reply.has_replied() {
                return;
            }
            if let Err(error) = handler.handle(ctx, reply).await {
                warn!(event = %ctx.event, %error, "handler failed");
                reply.reply_with(Value::Null, codes::HANDLER_ERROR, "handler error");
                return;
            }
        }

        if !reply.has_replied() {
            if ctx.fetch_id.is_some() {
                reply.reply_with(
                    Value::Null,
                    codes::NO_HANDLER,
                    format!("no handler replied to event '{}'", ctx.event),
                );
            } else {
                // The sender did not ask for a reply; drop silently.
                debug!(event = %ctx.event, "unhandled event without fetch id dropped");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
