//! The one-shot reply capability handed to middleware and handlers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::FetchConfig;
use crate::envelope::{Envelope, MessageBody};
use crate::ids::FetchId;

/// Outbound text sink for one connection.
///
/// Implementations must never block and never panic: sending to a closed or
/// congested connection returns `false` and the frame is dropped.
pub trait OutboundSink: Send + Sync {
    /// Enqueue one serialized frame. Returns `false` if the connection is
    /// gone or its queue is full.
    fn send_text(&self, text: String) -> bool;
}

impl OutboundSink for tokio::sync::mpsc::Sender<String> {
    fn send_text(&self, text: String) -> bool {
        self.try_send(text).is_ok()
    }
}

/// First-responder-wins reply capability for one inbound event.
///
/// The first call to [`Replier::reply`] (or [`Replier::reply_with`]) sends a
/// reply envelope; every later call for the same inbound event is a silent
/// no-op. A reply sent after its connection tore down fails silently at the
/// sink.
pub struct Replier {
    sink: Arc<dyn OutboundSink>,
    fetch_id: Option<FetchId>,
    default_code: u16,
    default_msg: String,
    replied: AtomicBool,
}

impl Replier {
    /// Build a replier for one inbound event envelope.
    #[must_use]
    pub fn new(sink: Arc<dyn OutboundSink>, fetch_id: Option<FetchId>, fetch: &FetchConfig) -> Self {
        Self {
            sink,
            fetch_id,
            default_code: fetch.code,
            default_msg: fetch.msg.clone(),
            replied: AtomicBool::new(false),
        }
    }

    /// Reply with `data` and the configured default code/message.
    pub fn reply(&self, data: Value) {
        let body = MessageBody::with(self.default_code, data, self.default_msg.clone());
        self.send_once(body);
    }

    /// Reply with explicit code and message.
    pub fn reply_with(&self, data: Value, code: u16, msg: impl Into<String>) {
        self.send_once(MessageBody::with(code, data, msg));
    }

    /// Whether a reply has already been sent for this event.
    #[must_use]
    pub fn has_replied(&self) -> bool {
        self.replied.load(Ordering::SeqCst)
    }

    /// The correlation id of the inbound event, if the sender awaits one.
    #[must_use]
    pub fn fetch_id(&self) -> Option<&FetchId> {
        self.fetch_id.as_ref()
    }

    fn send_once(&self, body: MessageBody) {
        if self.replied.swap(true, Ordering::SeqCst) {
            debug!(fetch_id = ?self.fetch_id, "duplicate reply suppressed");
            return;
        }
        let envelope = Envelope::reply(self.fetch_id.clone(), body);
        match envelope.encode() {
            Ok(text) => {
                if !self.sink.send_text(text) {
                    debug!(fetch_id = ?self.fetch_id, "reply dropped, connection gone");
                }
            }
            Err(error) => {
                warn!(%error, "failed to serialize reply envelope");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
