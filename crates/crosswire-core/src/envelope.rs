//! Wire envelope types and codec.
//!
//! One envelope travels per transport frame, serialized as JSON. The `type`
//! field distinguishes events (which may request a reply via `fetchId`) from
//! replies (which settle the pending request with the matching `fetchId`).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::ProtocolError;
use crate::ids::FetchId;

/// Reserved event sent once by the accepting side right after connection
/// establishment, carrying `{ "id": <assigned peer id> }`. Informational
/// only; it never requests a reply.
pub const SYSTEM_ID_EVENT: &str = "_system_id";

/// Reply codes used by the protocol itself (not application-defined).
pub mod codes {
    /// Default success code.
    pub const OK: u16 = 200;
    /// Envelope could not be parsed.
    pub const BAD_ENVELOPE: u16 = 400;
    /// No handler matched the event and a reply was owed.
    pub const NO_HANDLER: u16 = 404;
    /// Payload exceeded the configured size limit.
    pub const PAYLOAD_TOO_LARGE: u16 = 413;
    /// A middleware or handler failed.
    pub const HANDLER_ERROR: u16 = 500;
}

/// The application-visible payload carried by every envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Status code (default 200).
    pub code: u16,
    /// Arbitrary structured data.
    pub data: Value,
    /// Human-readable message (default `"success"`).
    pub msg: String,
}

impl MessageBody {
    /// A `200 success` body wrapping `data`.
    #[must_use]
    pub fn ok(data: Value) -> Self {
        Self {
            code: codes::OK,
            data,
            msg: "success".to_owned(),
        }
    }

    /// A body with explicit code and message.
    #[must_use]
    pub fn with(code: u16, data: Value, msg: impl Into<String>) -> Self {
        Self {
            code,
            data,
            msg: msg.into(),
        }
    }
}

/// Whether an envelope carries an event or a reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// An application event, optionally awaiting a reply.
    Event,
    /// The reply settling a previously sent event.
    Reply,
}

/// The wire-level container, one per transport frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Event or reply.
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    /// Event name; required when `kind` is [`EnvelopeKind::Event`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    /// Correlation id; present iff the sender awaits (event) or settles
    /// (reply) a pending request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_id: Option<FetchId>,
    /// The payload.
    pub body: MessageBody,
    /// Free-form string metadata. Insertion order is irrelevant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub header: Option<HashMap<String, String>>,
}

impl Envelope {
    /// A fire-and-forget event envelope (no reply expected).
    #[must_use]
    pub fn event(name: impl Into<String>, body: MessageBody) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            event: Some(name.into()),
            fetch_id: None,
            body,
            header: None,
        }
    }

    /// An event envelope awaiting the reply correlated by `fetch_id`.
    #[must_use]
    pub fn event_with_fetch_id(
        name: impl Into<String>,
        fetch_id: FetchId,
        body: MessageBody,
    ) -> Self {
        Self {
            kind: EnvelopeKind::Event,
            event: Some(name.into()),
            fetch_id: Some(fetch_id),
            body,
            header: None,
        }
    }

    /// A reply envelope. `fetch_id` is echoed from the event being answered
    /// when the sender asked for a reply.
    #[must_use]
    pub fn reply(fetch_id: Option<FetchId>, body: MessageBody) -> Self {
        Self {
            kind: EnvelopeKind::Reply,
            event: None,
            fetch_id,
            body,
            header: None,
        }
    }

    /// Attach a header map.
    #[must_use]
    pub fn with_header(mut self, header: HashMap<String, String>) -> Self {
        self.header = Some(header);
        self
    }

    /// Serialize to the JSON wire form.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse and validate one wire frame.
    ///
    /// Event envelopes without an `event` name are rejected as malformed.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let envelope: Self =
            serde_json::from_str(text).map_err(|e| ProtocolError::Malformed {
                detail: e.to_string(),
            })?;
        if envelope.kind == EnvelopeKind::Event && envelope.event.is_none() {
            return Err(ProtocolError::Malformed {
                detail: "event envelope missing 'event' field".to_owned(),
            });
        }
        Ok(envelope)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
