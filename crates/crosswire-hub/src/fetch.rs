//! Outbound fetch engine: single-target, multi-target, and group fan-out.

use std::sync::Arc;

use crosswire_core::{
    Envelope, FetchError, FetchOptions, FetchOutcome, MessageBody, PeerId,
};
use futures::future::{self, Either, join_all};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::hub::Hub;
use crate::peer::Peer;

impl Hub {
    /// Send `event` to every target and collect one outcome per target, in
    /// target order.
    ///
    /// Each target settles independently: unknown ids yield
    /// [`FetchError::TargetNotFound`], queue failures
    /// [`FetchError::SendFailed`], missed deadlines [`FetchError::Timeout`],
    /// and mid-flight disconnects [`FetchError::Disconnected`]. One slow or
    /// dead target never fails the others. With `has_reply` off the send is
    /// fire-and-forget and the result is empty.
    #[instrument(skip_all, fields(event = %event, targets = targets.len()))]
    pub async fn fetch(
        &self,
        targets: &[PeerId],
        event: &str,
        data: Value,
        opts: &FetchOptions,
    ) -> Vec<FetchOutcome> {
        let cfg = self.config().fetch.merge(opts);
        let body = MessageBody::with(cfg.code, data, cfg.msg.clone());

        if !cfg.has_reply {
            let _ = self.send(targets, &Envelope::event(event, body));
            return Vec::new();
        }

        let waits = targets
            .iter()
            .map(|target| match self.peer(target) {
                None => Either::Left(future::ready(Err(FetchError::TargetNotFound {
                    target: target.to_string(),
                }))),
                Some(peer) => Either::Right(self.dispatch_fetch(
                    peer,
                    target,
                    event,
                    body.clone(),
                    cfg.max_wait_ms,
                )),
            })
            .collect::<Vec<_>>();

        join_all(waits).await
    }

    /// Send `event` to one target and await its outcome.
    pub async fn fetch_one(
        &self,
        target: &PeerId,
        event: &str,
        data: Value,
        opts: &FetchOptions,
    ) -> FetchOutcome {
        let mut outcomes = self
            .fetch(std::slice::from_ref(target), event, data, opts)
            .await;
        match outcomes.pop() {
            Some(outcome) => outcome,
            // fetch() returns one outcome per target unless fire-and-forget.
            None => Ok(MessageBody::ok(Value::Null)),
        }
    }

    /// Fan `event` out to the de-duplicated union of the named groups'
    /// members. Unknown or empty groups yield an empty result, not an error.
    pub async fn fetch_by_group<S: AsRef<str> + Sync>(
        &self,
        groups: &[S],
        event: &str,
        data: Value,
        opts: &FetchOptions,
    ) -> Vec<FetchOutcome> {
        let members = self.members_of(groups);
        if members.is_empty() {
            debug!(event = %event, "group fan-out found no members");
            return Vec::new();
        }
        self.fetch(&members, event, data, opts).await
    }

    /// Enqueue one envelope to every target, with a per-target result.
    ///
    /// No reply tracking: unknown ids report [`FetchError::TargetNotFound`],
    /// refused queues [`FetchError::SendFailed`].
    pub fn send(&self, targets: &[PeerId], envelope: &Envelope) -> Vec<Result<(), FetchError>> {
        targets
            .iter()
            .map(|target| match self.peer(target) {
                None => {
                    debug!(target = %target, "send to unknown target dropped");
                    Err(FetchError::TargetNotFound {
                        target: target.to_string(),
                    })
                }
                Some(peer) => {
                    if peer.send_envelope(envelope) {
                        Ok(())
                    } else {
                        Err(FetchError::SendFailed {
                            detail: "outbound queue full or closed".to_owned(),
                        })
                    }
                }
            })
            .collect()
    }

    /// Fire-and-forget send to every target, regardless of configured
    /// defaults.
    pub async fn emit(&self, targets: &[PeerId], event: &str, data: Value) {
        let _ = self
            .fetch(
                targets,
                event,
                data,
                &FetchOptions::default().fire_and_forget(),
            )
            .await;
    }

    async fn dispatch_fetch(
        &self,
        peer: Arc<Peer>,
        target: &PeerId,
        event: &str,
        body: MessageBody,
        max_wait_ms: u64,
    ) -> FetchOutcome {
        let (fetch_id, rx) = self.tracker().register(target, max_wait_ms);
        let envelope = Envelope::event_with_fetch_id(event, fetch_id.clone(), body);
        if !peer.send_envelope(&envelope) {
            self.tracker().reject(
                &fetch_id,
                FetchError::SendFailed {
                    detail: "outbound queue full or closed".to_owned(),
                },
            );
        }
        // A dropped sender means the tracker entry vanished without settling,
        // which only happens on teardown races.
        rx.await.unwrap_or(Err(FetchError::Disconnected {
            reason: "close".to_owned(),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use assert_matches::assert_matches;
    use crosswire_core::{DisconnectReason, EnvelopeKind};
    use serde_json::json;
    use tokio::sync::mpsc;

    async fn accept_peer(hub: &Arc<Hub>) -> (Arc<Peer>, mpsc::Receiver<String>) {
        let (tx, mut rx) = mpsc::channel(32);
        let peer = hub.accept(tx).await;
        let _hello = rx.recv().await.unwrap();
        (peer, rx)
    }

    /// Reads the next outbound frame and feeds back an echo reply, as a
    /// well-behaved remote would.
    fn echo_remote(hub: Arc<Hub>, peer: Arc<Peer>, mut rx: mpsc::Receiver<String>) {
        let _ = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                let env = Envelope::decode(&text).unwrap();
                if env.kind != EnvelopeKind::Event {
                    continue;
                }
                if let Some(fetch_id) = env.fetch_id {
                    let reply = Envelope::reply(Some(fetch_id), MessageBody::ok(env.body.data));
                    hub.handle_text(&peer, &reply.encode().unwrap()).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn fetch_one_round_trip() {
        let hub = Hub::new(HubConfig::default());
        let (peer, rx) = accept_peer(&hub).await;
        echo_remote(hub.clone(), peer.clone(), rx);

        let outcome = hub
            .fetch_one(&peer.id, "echo", json!({"n": 3}), &FetchOptions::default())
            .await;
        let body = outcome.unwrap();
        assert_eq!(body.code, 200);
        assert_eq!(body.data["n"], 3);
        assert_eq!(hub.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn fetch_unknown_target_fails_fast() {
        let hub = Hub::new(HubConfig::default());
        let outcome = hub
            .fetch_one(
                &PeerId::from("ghost"),
                "echo",
                json!(null),
                &FetchOptions::default(),
            )
            .await;
        assert_matches!(
            outcome,
            Err(FetchError::TargetNotFound { ref target }) if target == "ghost"
        );
    }

    #[tokio::test]
    async fn multi_target_keeps_order_and_isolates_failures() {
        let hub = Hub::new(HubConfig::default());
        let (alive, rx) = accept_peer(&hub).await;
        echo_remote(hub.clone(), alive.clone(), rx);

        let targets = vec![alive.id.clone(), PeerId::from("ghost")];
        let outcomes = hub
            .fetch(&targets, "echo", json!("hi"), &FetchOptions::default())
            .await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].as_ref().unwrap().data, json!("hi"));
        assert_matches!(outcomes[1], Err(FetchError::TargetNotFound { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_times_out_without_reply() {
        let hub = Hub::new(HubConfig::default());
        let (peer, _rx) = accept_peer(&hub).await;

        let outcome = hub
            .fetch_one(
                &peer.id,
                "echo",
                json!(null),
                &FetchOptions::default().max_wait_ms(200),
            )
            .await;
        assert_matches!(outcome, Err(FetchError::Timeout { max_wait_ms: 200 }));
        assert_eq!(hub.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn fire_and_forget_returns_no_outcomes() {
        let hub = Hub::new(HubConfig::default());
        let (peer, mut rx) = accept_peer(&hub).await;

        let outcomes = hub
            .fetch(
                std::slice::from_ref(&peer.id),
                "notify",
                json!({"x": 1}),
                &FetchOptions::default().fire_and_forget(),
            )
            .await;
        assert!(outcomes.is_empty());
        assert_eq!(hub.tracker().pending_count(), 0);

        let env = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(env.event.as_deref(), Some("notify"));
        assert!(env.fetch_id.is_none(), "fire-and-forget carries no fetch id");
    }

    #[tokio::test]
    async fn send_reports_per_target_results() {
        let hub = Hub::new(HubConfig::default());
        let (peer, mut rx) = accept_peer(&hub).await;

        let targets = vec![peer.id.clone(), PeerId::from("ghost")];
        let results = hub.send(&targets, &Envelope::event("tick", MessageBody::ok(json!(1))));

        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert_matches!(results[1], Err(FetchError::TargetNotFound { .. }));
        let env = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(env.event.as_deref(), Some("tick"));
    }

    #[tokio::test]
    async fn emit_sends_without_fetch_id() {
        let hub = Hub::new(HubConfig::default());
        let (peer, mut rx) = accept_peer(&hub).await;

        hub.emit(std::slice::from_ref(&peer.id), "tick", json!(1)).await;

        let env = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(env.event.as_deref(), Some("tick"));
        assert!(env.fetch_id.is_none());
    }

    #[tokio::test]
    async fn fetch_by_group_fans_out_to_members() {
        let hub = Hub::new(HubConfig::default());
        let (a, rx_a) = accept_peer(&hub).await;
        let (b, rx_b) = accept_peer(&hub).await;
        echo_remote(hub.clone(), a.clone(), rx_a);
        echo_remote(hub.clone(), b.clone(), rx_b);
        hub.join_group("room", &a.id).unwrap();
        hub.join_group("room", &b.id).unwrap();

        let outcomes = hub
            .fetch_by_group(&["room"], "echo", json!("all"), &FetchOptions::default())
            .await;
        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes {
            assert_eq!(outcome.unwrap().data, json!("all"));
        }
    }

    #[tokio::test]
    async fn fetch_by_unknown_group_is_empty() {
        let hub = Hub::new(HubConfig::default());
        let outcomes = hub
            .fetch_by_group(&["nope"], "echo", json!(null), &FetchOptions::default())
            .await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn fetch_by_overlapping_groups_hits_each_member_once() {
        let hub = Hub::new(HubConfig::default());
        let (a, rx_a) = accept_peer(&hub).await;
        echo_remote(hub.clone(), a.clone(), rx_a);
        hub.join_group("g1", &a.id).unwrap();
        hub.join_group("g2", &a.id).unwrap();

        let outcomes = hub
            .fetch_by_group(&["g1", "g2"], "echo", json!(1), &FetchOptions::default())
            .await;
        assert_eq!(outcomes.len(), 1, "deduplicated across groups");
    }

    #[tokio::test]
    async fn send_failure_settles_immediately() {
        let hub = Hub::new(HubConfig::default());
        let (tx, rx) = mpsc::channel(32);
        let peer = hub.accept(tx).await;
        drop(rx); // connection's outbound side gone

        let outcome = hub
            .fetch_one(&peer.id, "echo", json!(null), &FetchOptions::default())
            .await;
        assert_matches!(outcome, Err(FetchError::SendFailed { .. }));
        assert_eq!(hub.tracker().pending_count(), 0);
    }

    #[tokio::test]
    async fn teardown_mid_fetch_yields_disconnected() {
        let hub = Hub::new(HubConfig::default());
        let (peer, _rx) = accept_peer(&hub).await;

        let fetching = {
            let hub = hub.clone();
            let target = peer.id.clone();
            tokio::spawn(async move {
                hub.fetch_one(&target, "echo", json!(null), &FetchOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;
        hub.teardown(&peer.id, DisconnectReason::Error).await;

        let outcome = fetching.await.unwrap();
        assert_matches!(
            outcome,
            Err(FetchError::Disconnected { ref reason }) if reason == "error"
        );
    }
}
