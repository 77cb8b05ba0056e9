//! Hub configuration.

use crosswire_core::FetchConfig;
use serde::{Deserialize, Serialize};

/// Configuration for a [`crate::Hub`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubConfig {
    /// Inbound frames above this size are rejected with a 413 reply
    /// before parsing.
    pub max_payload_bytes: usize,
    /// Depth of each peer's outbound frame queue.
    pub outbound_queue: usize,
    /// Tear a connection down with a `timeout` reason if no frame arrives
    /// for this long (ms). `None` disables the idle check.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<u64>,
    /// Process-wide fetch defaults, overridable per call.
    pub fetch: FetchConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024, // 1 MiB
            outbound_queue: 1024,
            idle_timeout_ms: None,
            fetch: FetchConfig::default(),
        }
    }
}
