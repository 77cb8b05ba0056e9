//! Error taxonomy for the protocol core.
//!
//! Protocol errors are converted to reply envelopes and never escape the
//! inbound entry point. Engine-level failures ([`FetchError`]) surface as
//! rejected fetch outcomes, never as wire codes.

use crate::envelope::{MessageBody, codes};

/// Outcome of one reply-awaited send to one target.
pub type FetchOutcome = Result<MessageBody, FetchError>;

/// Engine-level failure of a fetch outcome.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The addressed peer id is not a live connection.
    #[error("target '{target}' not found")]
    TargetNotFound {
        /// The unresolvable peer id.
        target: String,
    },

    /// No reply arrived before the deadline.
    #[error("timeout after {max_wait_ms}ms")]
    Timeout {
        /// The wait that elapsed, in milliseconds.
        max_wait_ms: u64,
    },

    /// The owning connection went away while the request was outstanding.
    #[error("disconnected: {reason}")]
    Disconnected {
        /// Reason tag from teardown (`close`, `error`, `timeout`, ...).
        reason: String,
    },

    /// The outbound channel refused the frame (closed or full).
    #[error("send failed: {detail}")]
    SendFailed {
        /// What went wrong.
        detail: String,
    },
}

/// Group registry failure.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    /// Joining requires a live connection.
    #[error("peer '{peer_id}' not found")]
    PeerNotFound {
        /// The id that is not connected.
        peer_id: String,
    },
}

/// Inbound frame rejected before dispatch.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The frame did not parse as a valid envelope.
    #[error("malformed envelope: {detail}")]
    Malformed {
        /// Parser diagnostic.
        detail: String,
    },

    /// The frame exceeded the configured payload limit.
    #[error("payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Observed frame size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },
}

impl ProtocolError {
    /// The protocol reply code for this rejection.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::Malformed { .. } => codes::BAD_ENVELOPE,
            Self::PayloadTooLarge { .. } => codes::PAYLOAD_TOO_LARGE,
        }
    }

    /// The reply body sent back for this rejection.
    #[must_use]
    pub fn to_body(&self) -> MessageBody {
        MessageBody::with(self.code(), serde_json::Value::Null, self.to_string())
    }
}

/// Error returned by a middleware or event handler.
///
/// Caught at the pipeline boundary and converted to a code-500 reply; it
/// never propagates to the transport layer.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Description of the failure.
    pub message: String,
}

impl HandlerError {
    /// Build from any displayable message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Why a connection went away, as reported to the disconnect hook.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Orderly close (close frame or local `close()`).
    Close,
    /// Transport-level error.
    Error,
    /// Liveness or connect timeout.
    Timeout,
}

impl DisconnectReason {
    /// Stable lowercase tag for logs and `FetchError::Disconnected`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Close => "close",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
