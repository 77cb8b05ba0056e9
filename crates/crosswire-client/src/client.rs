//! The initiating-side endpoint and its reconnection driver.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use crosswire_core::backoff::reconnect_delay_ms;
use crosswire_core::{
    DisconnectReason, Envelope, EnvelopeKind, EventContext, EventHandler, FetchConfig, FetchError,
    FetchOptions, FetchOutcome, MessageBody, OutboundSink, PeerId, PendingTracker, Pipeline,
    ProtocolError, ReconnectConfig, Replier, SYSTEM_ID_EVENT,
};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::ClientError;
use crate::state::ConnectionState;

/// Configuration for a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// WebSocket URL of the hub (`ws://host:port/ws`).
    pub url: String,
    /// Reconnection schedule.
    pub reconnect: ReconnectConfig,
    /// Fetch defaults, overridable per call.
    pub fetch: FetchConfig,
    /// Inbound frames above this size are rejected with a 413 reply.
    pub max_payload_bytes: usize,
    /// Depth of the outbound frame queue.
    pub outbound_queue: usize,
}

impl ClientConfig {
    /// Defaults for the given hub URL.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: ReconnectConfig::default(),
            fetch: FetchConfig::default(),
            max_payload_bytes: 1024 * 1024,
            outbound_queue: 1024,
        }
    }
}

/// The initiating side of the Crosswire protocol.
///
/// One client maintains one connection to a hub, re-establishing it after
/// loss on a capped exponential schedule. Handlers registered via
/// [`Client::on`] serve events the hub pushes; [`Client::fetch`] sends
/// reply-awaited events the other way. All methods are callable from any
/// task; the connection itself is driven by one background task spawned by
/// [`Client::connect`].
pub struct Client {
    config: ClientConfig,
    tracker: Arc<PendingTracker>,
    pipeline: Pipeline,
    state_tx: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    // Stable local owner key for the tracker; independent of the id the
    // hub assigns, which changes on every reconnect.
    owner: PeerId,
    assigned_id: Mutex<Option<PeerId>>,
    driver_running: AtomicBool,
    attempts: AtomicU32,
}

impl Client {
    /// Create a client. No connection is attempted until
    /// [`Client::connect`].
    #[must_use]
    pub fn new(config: ClientConfig) -> Arc<Self> {
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            tracker: PendingTracker::new(),
            pipeline: Pipeline::new(),
            state_tx,
            cancel: CancellationToken::new(),
            writer: Mutex::new(None),
            owner: PeerId::new(),
            assigned_id: Mutex::new(None),
            driver_running: AtomicBool::new(false),
            attempts: AtomicU32::new(0),
        })
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

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Spawn the background driver. Calling again while it runs, or after
    /// [`Client::close`], is a no-op.
    pub fn connect(self: &Arc<Self>) {
        if self.cancel.is_cancelled() {
            return;
        }
        if self.driver_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let client = Arc::clone(self);
        let _ = tokio::spawn(async move {
            client.run().await;
        });
    }

    /// Permanently close the client: the driver stops, no reconnection is
    /// attempted, and outstanding fetches fail with `Disconnected`.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Watch channel for state transitions.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The id the hub assigned on the current connection, once the
    /// `_system_id` event has arrived.
    #[must_use]
    pub fn assigned_id(&self) -> Option<PeerId> {
        self.assigned_id.lock().clone()
    }

    /// Failed connection attempts since the last successful connect.
    #[must_use]
    pub fn failed_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until the client is connected.
    ///
    /// Fails once the driver has given up (retries exhausted or closed).
    pub async fn wait_connected(&self) -> Result<(), ClientError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected
                    if !self.driver_running.load(Ordering::SeqCst) =>
                {
                    return Err(ClientError::ConnectFailed {
                        attempts: self.failed_attempts(),
                    });
                }
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(ClientError::ConnectFailed {
                    attempts: self.failed_attempts(),
                });
            }
        }
    }

    // ── Fetch ───────────────────────────────────────────────────────

    /// Send `event` to the hub and await the reply.
    ///
    /// Fails immediately with [`FetchError::SendFailed`] while disconnected;
    /// the engine does not queue across reconnects.
    pub async fn fetch(&self, event: &str, data: Value, opts: &FetchOptions) -> FetchOutcome {
        let cfg = self.config.fetch.merge(opts);
        let body = MessageBody::with(cfg.code, data, cfg.msg.clone());
        let Some(sink) = self.writer.lock().clone() else {
            return Err(FetchError::SendFailed {
                detail: "not connected".to_owned(),
            });
        };

        if !cfg.has_reply {
            self.send_raw(&sink, &Envelope::event(event, body));
            return Ok(MessageBody::ok(Value::Null));
        }

        let (fetch_id, rx) = self.tracker.register(&self.owner, cfg.max_wait_ms);
        let envelope = Envelope::event_with_fetch_id(event, fetch_id.clone(), body);
        match envelope.encode() {
            Ok(text) => {
                if !sink.send_text(text) {
                    self.tracker.reject(
                        &fetch_id,
                        FetchError::SendFailed {
                            detail: "outbound queue full or closed".to_owned(),
                        },
                    );
                }
            }
            Err(error) => {
                self.tracker.reject(
                    &fetch_id,
                    FetchError::SendFailed {
                        detail: error.to_string(),
                    },
                );
            }
        }
        rx.await.unwrap_or(Err(FetchError::Disconnected {
            reason: "close".to_owned(),
        }))
    }

    /// Fire-and-forget send to the hub.
    pub async fn emit(&self, event: &str, data: Value) {
        let _ = self
            .fetch(event, data, &FetchOptions::default().fire_and_forget())
            .await;
    }

    fn send_raw(&self, sink: &mpsc::Sender<String>, envelope: &Envelope) {
        match envelope.encode() {
            Ok(text) => {
                if !sink.send_text(text) {
                    debug!("outbound frame dropped, queue full or closed");
                }
            }
            Err(error) => warn!(%error, "failed to serialize envelope"),
        }
    }

    // ── Driver ──────────────────────────────────────────────────────

    #[instrument(skip_all, fields(url = %self.config.url))]
    async fn run(self: Arc<Self>) {
        let reconnect = self.config.reconnect.clone();
        loop {
            self.set_state(ConnectionState::Connecting);
            let attempt = timeout(
                Duration::from_millis(reconnect.connect_timeout_ms),
                connect_async(&self.config.url),
            );
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = attempt => result,
            };

            match result {
                Ok(Ok((stream, _response))) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    let reason = self.drive_connection(stream).await;
                    *self.writer.lock() = None;
                    *self.assigned_id.lock() = None;
                    self.tracker.cancel_all(&self.owner, reason.as_str());
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    info!(%reason, "connection lost, scheduling reconnect");
                }
                Ok(Err(error)) => {
                    debug!(%error, "connection attempt failed");
                }
                Err(_elapsed) => {
                    debug!(
                        connect_timeout_ms = reconnect.connect_timeout_ms,
                        "connection attempt timed out"
                    );
                }
            }

            let failed = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if failed >= reconnect.max_reconnect_count {
                warn!(attempts = failed, "reconnect attempts exhausted, giving up");
                break;
            }
            let delay = reconnect_delay_ms(failed, reconnect.base_delay_ms, reconnect.max_delay_ms);
            debug!(attempt = failed, delay_ms = delay, "waiting before reconnect");
            self.set_state(ConnectionState::Disconnected);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = tokio::time::sleep(Duration::from_millis(delay)) => {}
            }
        }

        self.tracker.cancel_all(&self.owner, DisconnectReason::Close.as_str());
        // Flip the running flag before the final state notification so a
        // waiter observing Disconnected also observes the driver as stopped.
        self.driver_running.store(false, Ordering::SeqCst);
        self.set_state(ConnectionState::Disconnected);
    }

    async fn drive_connection(
        &self,
        stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    ) -> DisconnectReason {
        let (mut ws_tx, mut ws_rx) = stream.split();
        let (tx, mut rx) = mpsc::channel::<String>(self.config.outbound_queue);
        *self.writer.lock() = Some(tx.clone());
        self.set_state(ConnectionState::Connected);
        info!("connected");

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        let reason = loop {
            let frame = tokio::select! {
                () = self.cancel.cancelled() => break DisconnectReason::Close,
                frame = ws_rx.next() => frame,
            };
            match frame {
                // Frames are processed in arrival order, but a slow handler
                // must not delay close(), so processing stays cancellable.
                Some(Ok(Message::Text(text))) => {
                    tokio::select! {
                        () = self.cancel.cancelled() => break DisconnectReason::Close,
                        () = self.handle_text(&tx, text.as_str()) => {}
                    }
                }
                Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        tokio::select! {
                            () = self.cancel.cancelled() => break DisconnectReason::Close,
                            () = self.handle_text(&tx, text) => {}
                        }
                    }
                    Err(_) => debug!("non-utf8 binary frame ignored"),
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => break DisconnectReason::Close,
                Some(Err(error)) => {
                    warn!(%error, "websocket receive error");
                    break DisconnectReason::Error;
                }
            }
        };

        writer.abort();
        reason
    }

    // ── Inbound routing ─────────────────────────────────────────────

    async fn handle_text(&self, sink: &mpsc::Sender<String>, text: &str) {
        if text.len() > self.config.max_payload_bytes {
            let error = ProtocolError::PayloadTooLarge {
                size: text.len(),
                limit: self.config.max_payload_bytes,
            };
            warn!(size = text.len(), "oversized frame rejected");
            self.send_raw(sink, &Envelope::reply(None, error.to_body()));
            return;
        }

        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(error) => {
                warn!(%error, "malformed frame rejected");
                self.send_raw(sink, &Envelope::reply(None, error.to_body()));
                return;
            }
        };

        match envelope.kind {
            EnvelopeKind::Reply => {
                if let Some(fetch_id) = envelope.fetch_id {
                    self.tracker.resolve(&fetch_id, envelope.body);
                } else {
                    debug!("reply without fetch id dropped");
                }
            }
            EnvelopeKind::Event => {
                let Some(event) = envelope.event else {
                    return;
                };
                if event == SYSTEM_ID_EVENT {
                    self.store_assigned_id(&envelope.body);
                    return;
                }
                let replier = Replier::new(
                    Arc::new(sink.clone()),
                    envelope.fetch_id.clone(),
                    &self.config.fetch,
                );
                let ctx = EventContext {
                    event,
                    body: envelope.body,
                    // Sender identity is a receiver-side concept; on this
                    // side the only counterpart is the hub.
                    peer_id: None,
                    fetch_id: envelope.fetch_id,
                    header: envelope.header.unwrap_or_default(),
                };
                debug!(event = %ctx.event, "dispatching event");
                self.pipeline.dispatch(&ctx, &replier).await;
            }
        }
    }

    fn store_assigned_id(&self, body: &MessageBody) {
        if let Some(id) = body.data.get("id").and_then(Value::as_str) {
            debug!(assigned_id = id, "received assigned id");
            *self.assigned_id.lock() = Some(PeerId::from(id));
        } else {
            warn!("system id event without an 'id' field");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let _ = self.state_tx.send_replace(state);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn fast_config(url: &str) -> ClientConfig {
        let mut config = ClientConfig::new(url);
        config.reconnect = ReconnectConfig {
            max_reconnect_count: 2,
            base_delay_ms: 1,
            max_delay_ms: 2,
            connect_timeout_ms: 500,
        };
        config
    }

    #[tokio::test]
    async fn starts_disconnected() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.assigned_id().is_none());
    }

    #[tokio::test]
    async fn fetch_while_disconnected_fails_fast() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        let outcome = client
            .fetch("echo", json!(null), &FetchOptions::default())
            .await;
        assert_matches!(
            outcome,
            Err(FetchError::SendFailed { ref detail }) if detail == "not connected"
        );
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        // Port 1 refuses immediately, so each attempt fails fast.
        let client = Client::new(fast_config("ws://127.0.0.1:1/ws"));
        client.connect();
        let err = client.wait_connected().await.unwrap_err();
        assert_matches!(err, ClientError::ConnectFailed { attempts: 2 });
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn close_before_connect_makes_connect_a_noop() {
        let client = Client::new(fast_config("ws://127.0.0.1:1/ws"));
        client.close();
        client.connect();
        assert_matches!(
            client.wait_connected().await,
            Err(ClientError::ConnectFailed { .. })
        );
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = Client::new(fast_config("ws://127.0.0.1:1/ws"));
        client.close();
        client.close();
    }

    #[tokio::test]
    async fn system_id_event_updates_assigned_id() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        let (sink, _rx) = mpsc::channel(8);
        let hello = Envelope::event(
            SYSTEM_ID_EVENT,
            MessageBody::ok(json!({"id": "peer_abc"})),
        );
        client.handle_text(&sink, &hello.encode().unwrap()).await;
        assert_eq!(client.assigned_id(), Some(PeerId::from("peer_abc")));
    }

    #[tokio::test]
    async fn system_id_event_is_not_dispatched() {
        struct Panicking;

        #[async_trait::async_trait]
        impl EventHandler for Panicking {
            async fn handle(
                &self,
                _ctx: &EventContext,
                _reply: &Replier,
            ) -> Result<(), crosswire_core::HandlerError> {
                panic!("reserved event must not reach handlers");
            }
        }

        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        client.on(SYSTEM_ID_EVENT, Panicking);
        let (sink, _rx) = mpsc::channel(8);
        let hello = Envelope::event(SYSTEM_ID_EVENT, MessageBody::ok(json!({"id": "p"})));
        client.handle_text(&sink, &hello.encode().unwrap()).await;
    }

    #[tokio::test]
    async fn inbound_events_carry_no_peer_identity() {
        struct AssertAnonymous;

        #[async_trait::async_trait]
        impl EventHandler for AssertAnonymous {
            async fn handle(
                &self,
                ctx: &EventContext,
                reply: &Replier,
            ) -> Result<(), crosswire_core::HandlerError> {
                assert!(ctx.peer_id.is_none(), "hub-side identity must not leak");
                reply.reply(json!(null));
                Ok(())
            }
        }

        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        client.on("check", AssertAnonymous);
        let (sink, _rx) = mpsc::channel(8);

        // Even once an assigned id is known, handler contexts stay anonymous.
        let hello = Envelope::event(SYSTEM_ID_EVENT, MessageBody::ok(json!({"id": "peer_x"})));
        client.handle_text(&sink, &hello.encode().unwrap()).await;
        assert!(client.assigned_id().is_some());

        let event = Envelope::event("check", MessageBody::ok(json!(1)));
        client.handle_text(&sink, &event.encode().unwrap()).await;
    }

    #[tokio::test]
    async fn malformed_inbound_gets_400_reply() {
        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        let (sink, mut rx) = mpsc::channel(8);
        client.handle_text(&sink, "garbage").await;
        let reply = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.body.code, 400);
    }

    #[tokio::test]
    async fn oversized_inbound_gets_413_reply() {
        let mut config = ClientConfig::new("ws://127.0.0.1:1/ws");
        config.max_payload_bytes = 16;
        let client = Client::new(config);
        let (sink, mut rx) = mpsc::channel(8);
        client.handle_text(&sink, &"x".repeat(64)).await;
        let reply = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.body.code, 413);
    }

    #[tokio::test]
    async fn inbound_event_reaches_registered_handler() {
        struct Echo;

        #[async_trait::async_trait]
        impl EventHandler for Echo {
            async fn handle(
                &self,
                ctx: &EventContext,
                reply: &Replier,
            ) -> Result<(), crosswire_core::HandlerError> {
                reply.reply(ctx.body.data.clone());
                Ok(())
            }
        }

        let client = Client::new(ClientConfig::new("ws://127.0.0.1:1/ws"));
        client.on("echo", Echo);
        let (sink, mut rx) = mpsc::channel(8);
        let event = Envelope::event_with_fetch_id(
            "echo",
            crosswire_core::FetchId::from("f1"),
            MessageBody::ok(json!(7)),
        );
        client.handle_text(&sink, &event.encode().unwrap()).await;

        let reply = Envelope::decode(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(reply.kind, EnvelopeKind::Reply);
        assert_eq!(reply.fetch_id, Some(crosswire_core::FetchId::from("f1")));
        assert_eq!(reply.body.data, json!(7));
    }
}
