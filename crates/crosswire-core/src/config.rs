//! Fetch defaults, per-call overrides, and reconnect parameters.

use serde::{Deserialize, Serialize};

/// Default reply wait in milliseconds.
pub const DEFAULT_MAX_WAIT_MS: u64 = 10_000;
/// Default success code for outgoing bodies.
pub const DEFAULT_CODE: u16 = 200;
/// Default message for outgoing bodies.
pub const DEFAULT_MSG: &str = "success";

/// Process-wide defaults for `fetch`, overridable per call via
/// [`FetchOptions`]. Never persisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchConfig {
    /// How long to wait for a reply before failing with a timeout (ms).
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    /// Whether the send awaits a reply at all.
    #[serde(default = "default_has_reply")]
    pub has_reply: bool,
    /// Code stamped on outgoing event bodies.
    #[serde(default = "default_code")]
    pub code: u16,
    /// Message stamped on outgoing event bodies.
    #[serde(default = "default_msg")]
    pub msg: String,
}

fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}
fn default_has_reply() -> bool {
    true
}
fn default_code() -> u16 {
    DEFAULT_CODE
}
fn default_msg() -> String {
    DEFAULT_MSG.to_owned()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
            has_reply: true,
            code: DEFAULT_CODE,
            msg: DEFAULT_MSG.to_owned(),
        }
    }
}

impl FetchConfig {
    /// Apply a per-call override on top of these defaults.
    #[must_use]
    pub fn merge(&self, opts: &FetchOptions) -> Self {
        Self {
            max_wait_ms: opts.max_wait_ms.unwrap_or(self.max_wait_ms),
            has_reply: opts.has_reply.unwrap_or(self.has_reply),
            code: opts.code.unwrap_or(self.code),
            msg: opts.msg.clone().unwrap_or_else(|| self.msg.clone()),
        }
    }
}

/// Per-call override of [`FetchConfig`]; unset fields keep the defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchOptions {
    /// Override the reply wait (ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
    /// Override whether a reply is awaited.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub has_reply: Option<bool>,
    /// Override the outgoing body code.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    /// Override the outgoing body message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl FetchOptions {
    /// Override the reply wait.
    #[must_use]
    pub fn max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = Some(ms);
        self
    }

    /// Send without awaiting a reply.
    #[must_use]
    pub fn fire_and_forget(mut self) -> Self {
        self.has_reply = Some(false);
        self
    }
}

/// Client reconnection parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconnectConfig {
    /// Give up after this many consecutive failed attempts.
    #[serde(default = "default_max_reconnect_count")]
    pub max_reconnect_count: u32,
    /// Base delay for the exponential schedule (ms).
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Ceiling on the delay between attempts (ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// An attempt that has not reached `Connected` within this window
    /// counts as failed (ms).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_max_reconnect_count() -> u32 {
    5
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_connect_timeout_ms() -> u64 {
    10_000
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_reconnect_count: default_max_reconnect_count(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
