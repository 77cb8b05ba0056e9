//! The hub: live peer set, inbound routing, and teardown.

use std::sync::Arc;

use crosswire_core::{
    DisconnectReason, Envelope, EnvelopeKind, EventContext, EventHandler, GroupError, MessageBody,
    PendingTracker, PeerId, Pipeline, ProtocolError, Replier, SYSTEM_ID_EVENT,
};
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::HubConfig;
use crate::groups::GroupRegistry;
use crate::hooks::{ConnectionHooks, NoopHooks};
use crate::peer::Peer;

/// The accepting-side endpoint.
///
/// Owns every live connection, the group registry, the pending-request
/// tracker, and the dispatch pipeline. Constructed once per process and
/// shared by handle; shutdown is a matter of dropping the host listener and
/// letting per-connection teardown drain the tracker.
pub struct Hub {
    config: HubConfig,
    peers: DashMap<PeerId, Arc<Peer>>,
    groups: GroupRegistry,
    tracker: Arc<PendingTracker>,
    pipeline: Pipeline,
    hooks: Arc<dyn ConnectionHooks>,
}

impl Hub {
    /// Create a hub with default (no-op) hooks.
    #[must_use]
    pub fn new(config: HubConfig) -> Arc<Self> {
        Self::with_hooks(config, Arc::new(NoopHooks))
    }

    /// Create a hub with custom lifecycle hooks.
    #[must_use]
    pub fn with_hooks(config: HubConfig, hooks: Arc<dyn ConnectionHooks>) -> Arc<Self> {
        Arc::new(Self {
            config,
            peers: DashMap::new(),
            groups: GroupRegistry::new(),
            tracker: PendingTracker::new(),
            pipeline: Pipeline::new(),
            hooks,
        })
    }

    /// The hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    /// The pending-request tracker (shared with the fetch engine).
    #[must_use]
    pub(crate) fn tracker(&self) -> &Arc<PendingTracker> {
        &self.tracker
    }

    // ── Registration ────────────────────────────────────────────────

    /// Register an event handler. Multiple handlers for one event run in
    /// registration order until one replies.
    pub fn on(&self, event: impl Into<String>, handler: impl EventHandler + 'static) {
        self.pipeline.on(event, handler);
    }

    /// Append a middleware, run before any handler on every inbound event.
    pub fn use_middleware(&self, middleware: impl EventHandler + 'static) {
        self.pipeline.use_middleware(middleware);
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Accept a new connection whose outbound frames go to `tx`.
    ///
    /// Allocates a fresh peer id, registers the peer, invokes the connect
    /// hook, and queues the reserved `_system_id` event so the other side
    /// learns its assigned id.
    pub async fn accept(&self, tx: mpsc::Sender<String>) -> Arc<Peer> {
        let peer = Arc::new(Peer::new(PeerId::new(), tx));
        let _ = self.peers.insert(peer.id.clone(), peer.clone());
        info!(peer_id = %peer.id, peers = self.peers.len(), "peer connected");

        self.hooks.on_connect(&peer).await;

        let hello = Envelope::event(
            SYSTEM_ID_EVENT,
            MessageBody::ok(json!({ "id": peer.id })),
        );
        if !peer.send_envelope(&hello) {
            warn!(peer_id = %peer.id, "failed to queue system id event");
        }
        peer
    }

    /// Tear down a connection: fail its pending requests, drop its group
    /// memberships, remove it from the live set, and fire the disconnect
    /// hook. Idempotent.
    pub async fn teardown(&self, peer_id: &PeerId, reason: DisconnectReason) {
        // Remove from the live set first: join_group re-checks liveness
        // after inserting, so group state left by a racing join is always
        // cleaned up by one side or the other.
        let removed = self.peers.remove(peer_id).is_some();
        self.tracker.cancel_all(peer_id, reason.as_str());
        self.groups.drop_peer(peer_id);
        if removed {
            info!(peer_id = %peer_id, %reason, peers = self.peers.len(), "peer disconnected");
            self.hooks.on_disconnect(peer_id, reason).await;
        }
    }

    /// Look up a live peer.
    #[must_use]
    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<Peer>> {
        self.peers.get(peer_id).map(|entry| entry.value().clone())
    }

    /// Ids of all live peers, in sorted order.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.iter().map(|e| e.key().clone()).collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Number of live peers.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    // ── Groups ──────────────────────────────────────────────────────

    /// Add a live peer to a group.
    pub fn join_group(&self, group: &str, peer_id: &PeerId) -> Result<(), GroupError> {
        if !self.peers.contains_key(peer_id) {
            return Err(GroupError::PeerNotFound {
                peer_id: peer_id.to_string(),
            });
        }
        self.groups.join(group, peer_id);
        // A teardown may have completed between the liveness check and the
        // insert. Teardown removes from the live set before dropping group
        // state, so if the peer is gone now its teardown can no longer be
        // relied on to see this membership; undo it here.
        if !self.peers.contains_key(peer_id) {
            self.groups.drop_peer(peer_id);
            return Err(GroupError::PeerNotFound {
                peer_id: peer_id.to_string(),
            });
        }
        Ok(())
    }

    /// Remove a peer from a group. Idempotent, also for dead peers.
    pub fn leave_group(&self, group: &str, peer_id: &PeerId) {
        self.groups.leave(group, peer_id);
    }

    /// De-duplicated union of members across the named groups.
    #[must_use]
    pub fn members_of<S: AsRef<str>>(&self, groups: &[S]) -> Vec<PeerId> {
        self.groups.members_of(groups)
    }

    /// Groups a peer currently belongs to.
    #[must_use]
    pub fn groups_of(&self, peer_id: &PeerId) -> Vec<String> {
        self.groups.groups_of(peer_id)
    }

    // ── Inbound routing ─────────────────────────────────────────────

    /// Process one inbound text frame from `peer`.
    ///
    /// Never panics and never propagates an error to the transport:
    /// oversized input gets a 413 reply without parsing, malformed input a
    /// 400 reply, replies settle the tracker, events run the pipeline. The
    /// session loop awaits this before reading the next frame, so frames on
    /// one connection are processed in arrival order.
    pub async fn handle_text(&self, peer: &Arc<Peer>, text: &str) {
        if text.len() > self.config.max_payload_bytes {
            let error = ProtocolError::PayloadTooLarge {
                size: text.len(),
                limit: self.config.max_payload_bytes,
            };
            warn!(peer_id = %peer.id, size = text.len(), "oversized frame rejected");
            let _ = peer.send_envelope(&Envelope::reply(None, error.to_body()));
            return;
        }

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(peer_id = %peer.id, %error, "malformed frame rejected");
                let _ = peer.send_envelope(&Envelope::reply(None, error.to_body()));
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::Reply => {
                if let Some(fetch_id) = envelope.fetch_id {
                    self.tracker.resolve(&fetch_id, envelope.body);
                } else {
                    debug!(peer_id = %peer.id, "reply without fetch id dropped");
                }
            }
            EnvelopeKind::Event => {
                // decode() guarantees the name is present for events.
                let Some(event) = envelope.event else {
                    return;
                };
                let replier = Replier::new(
                    peer.clone(),
                    envelope.fetch_id.clone(),
                    &self.config.fetch,
                );
                let ctx = EventContext {
                    event,
                    body: envelope.body,
                    peer_id: Some(peer.id.clone()),
                    fetch_id: envelope.fetch_id,
                    header: envelope.header.unwrap_or_default(),
                };
                debug!(peer_id = %peer.id, event = %ctx.event, "dispatching event");
                self.pipeline.dispatch(&ctx, &replier).await;
            }
        }
    }

    /// Whether the connect hook authorizes this connection.
    pub(crate) async fn authorize(
        &self,
        header: &std::collections::HashMap<String, String>,
    ) -> bool {
        self.hooks.authorize(header).await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
