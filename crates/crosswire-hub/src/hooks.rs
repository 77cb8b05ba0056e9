//! Pluggable connection lifecycle hooks.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use crosswire_core::{DisconnectReason, PeerId};

use crate::peer::Peer;

/// Strategy object injected at hub construction to observe connection
/// lifecycle and gate acceptance.
///
/// All methods default to no-ops; `authorize` defaults to accepting
/// everything. Crosswire ships no authentication of its own — `authorize`
/// is the hook point for one.
#[async_trait]
pub trait ConnectionHooks: Send + Sync {
    /// Gate a new connection. Returning `false` closes it before the peer
    /// is registered.
    async fn authorize(&self, header: &HashMap<String, String>) -> bool {
        let _ = header;
        true
    }

    /// A peer was accepted and registered.
    async fn on_connect(&self, peer: &Arc<Peer>) {
        let _ = peer;
    }

    /// A peer was torn down. `reason` is the tag (`close`, `error`,
    /// `timeout`) that also reaches that peer's failed fetch outcomes.
    async fn on_disconnect(&self, peer_id: &PeerId, reason: DisconnectReason) {
        let _ = (peer_id, reason);
    }
}

/// The default hooks: accept everything, observe nothing.
pub struct NoopHooks;

#[async_trait]
impl ConnectionHooks for NoopHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn noop_hooks_authorize_everything() {
        let hooks = NoopHooks;
        assert!(hooks.authorize(&HashMap::new()).await);
    }

    #[tokio::test]
    async fn noop_hooks_callbacks_do_nothing() {
        let hooks = NoopHooks;
        let (tx, _rx) = mpsc::channel(1);
        let peer = Arc::new(Peer::new(PeerId::from("p1"), tx));
        hooks.on_connect(&peer).await;
        hooks
            .on_disconnect(&PeerId::from("p1"), DisconnectReason::Close)
            .await;
    }
}
