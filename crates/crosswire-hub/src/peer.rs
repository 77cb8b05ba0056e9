//! One live connection's identity and outbound channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crosswire_core::{Envelope, OutboundSink, PeerId};
use tokio::sync::mpsc;
use tracing::warn;

/// A connected peer, exclusively owned by the [`crate::Hub`].
///
/// Handlers receive an `Arc<Peer>` but the hub removes the peer from its
/// live set on disconnect; sends after that point fail silently.
pub struct Peer {
    /// Unique connection id. Not reused while this peer is connected.
    pub id: PeerId,
    tx: mpsc::Sender<String>,
    /// When this connection was accepted.
    pub connected_at: Instant,
    dropped_frames: AtomicU64,
}

impl Peer {
    /// Wrap an outbound channel as a peer.
    #[must_use]
    pub fn new(id: PeerId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            dropped_frames: AtomicU64::new(0),
        }
    }

    /// Enqueue one serialized frame.
    ///
    /// Returns `false` if the channel is full or closed, and increments the
    /// dropped-frame counter.
    pub fn send(&self, text: String) -> bool {
        if self.tx.try_send(text).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Serialize and enqueue an envelope.
    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(text) => self.send(text),
            Err(error) => {
                warn!(peer_id = %self.id, %error, "failed to serialize envelope");
                false
            }
        }
    }

    /// Frames dropped because the outbound queue was full or closed.
    #[must_use]
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Connection age.
    #[must_use]
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl OutboundSink for Peer {
    fn send_text(&self, text: String) -> bool {
        self.send(text)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
