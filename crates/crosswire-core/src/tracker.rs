//! Pending-request bookkeeping for reply-awaited sends.
//!
//! Every outstanding fetch is one entry: a oneshot sender the caller awaits,
//! the owning connection id, and an abortable deadline timer. Exactly one of
//! resolve / expire / cancel fires per entry; the loser of any race finds
//! the entry already gone and is a documented no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::debug;

use crate::envelope::MessageBody;
use crate::errors::{FetchError, FetchOutcome};
use crate::ids::{FetchId, PeerId};

struct PendingEntry {
    owner: PeerId,
    tx: oneshot::Sender<FetchOutcome>,
    timer: AbortHandle,
}

#[derive(Default)]
struct Inner {
    pending: HashMap<FetchId, PendingEntry>,
    // Reverse index so teardown is O(owner's pending), not O(total).
    by_owner: HashMap<PeerId, HashSet<FetchId>>,
}

/// Tracks outstanding reply-awaited requests for one endpoint.
///
/// All mutation is serialized behind one mutex; the oneshot sends happen
/// after the entry has been removed, so callers on unrelated fetch ids
/// never block on each other's continuations.
#[derive(Default)]
pub struct PendingTracker {
    inner: Mutex<Inner>,
}

impl PendingTracker {
    /// Create an empty tracker.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a new pending request owned by `owner`.
    ///
    /// Returns the fresh correlation id and the receiver the caller awaits.
    /// A deadline timer is started; if it fires first the receiver settles
    /// with [`FetchError::Timeout`].
    pub fn register(
        self: &Arc<Self>,
        owner: &PeerId,
        max_wait_ms: u64,
    ) -> (FetchId, oneshot::Receiver<FetchOutcome>) {
        let fetch_id = FetchId::new();
        let (tx, rx) = oneshot::channel();

        // Insert under the same lock the timer's expire() will take, so the
        // timer cannot observe a half-registered entry.
        let mut inner = self.inner.lock();
        let timer = {
            let tracker = Arc::clone(self);
            let id = fetch_id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(max_wait_ms)).await;
                tracker.expire(&id, max_wait_ms);
            })
            .abort_handle()
        };
        let _ = inner.pending.insert(
            fetch_id.clone(),
            PendingEntry {
                owner: owner.clone(),
                tx,
                timer,
            },
        );
        let _ = inner
            .by_owner
            .entry(owner.clone())
            .or_default()
            .insert(fetch_id.clone());

        (fetch_id, rx)
    }

    /// Settle a pending request with the reply body.
    ///
    /// Unknown ids (already resolved, expired, cancelled, or never issued)
    /// are a silent no-op.
    pub fn resolve(&self, fetch_id: &FetchId, body: MessageBody) {
        if let Some(entry) = self.take(fetch_id) {
            entry.timer.abort();
            let _ = entry.tx.send(Ok(body));
        } else {
            debug!(fetch_id = %fetch_id, "reply for unknown fetch id ignored");
        }
    }

    /// Deadline callback: settle with a timeout failure. No-op if the entry
    /// already settled.
    pub fn expire(&self, fetch_id: &FetchId, max_wait_ms: u64) {
        if let Some(entry) = self.take(fetch_id) {
            debug!(fetch_id = %fetch_id, max_wait_ms, "pending request expired");
            let _ = entry.tx.send(Err(FetchError::Timeout { max_wait_ms }));
        }
    }

    /// Settle with an explicit failure (e.g. the outbound send never left).
    pub fn reject(&self, fetch_id: &FetchId, error: FetchError) {
        if let Some(entry) = self.take(fetch_id) {
            entry.timer.abort();
            let _ = entry.tx.send(Err(error));
        }
    }

    /// Disconnect teardown: fail every request owned by `owner` with
    /// [`FetchError::Disconnected`] and clear both indices for that owner.
    pub fn cancel_all(&self, owner: &PeerId, reason: &str) {
        let entries: Vec<PendingEntry> = {
            let mut inner = self.inner.lock();
            let Some(ids) = inner.by_owner.remove(owner) else {
                return;
            };
            ids.into_iter()
                .filter_map(|id| inner.pending.remove(&id))
                .collect()
        };
        debug!(owner = %owner, count = entries.len(), reason, "cancelling pending requests");
        for entry in entries {
            entry.timer.abort();
            let _ = entry.tx.send(Err(FetchError::Disconnected {
                reason: reason.to_owned(),
            }));
        }
    }

    /// Total outstanding requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Outstanding requests owned by one connection.
    #[must_use]
    pub fn owner_pending(&self, owner: &PeerId) -> usize {
        self.inner
            .lock()
            .by_owner
            .get(owner)
            .map_or(0, HashSet::len)
    }

    fn take(&self, fetch_id: &FetchId) -> Option<PendingEntry> {
        let mut inner = self.inner.lock();
        let entry = inner.pending.remove(fetch_id)?;
        if let Some(ids) = inner.by_owner.get_mut(&entry.owner) {
            let _ = ids.remove(fetch_id);
            if ids.is_empty() {
                let _ = inner.by_owner.remove(&entry.owner);
            }
        }
        Some(entry)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
