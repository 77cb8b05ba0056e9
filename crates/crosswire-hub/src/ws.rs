//! Axum WebSocket transport: upgrade route and per-connection session loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use crosswire_core::DisconnectReason;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::hub::Hub;

/// Build a router exposing the hub at `GET /ws`.
#[must_use]
pub fn router(hub: Arc<Hub>) -> Router {
    Router::new().route("/ws", get(upgrade)).with_state(hub)
}

impl Hub {
    /// Convenience for [`router`], to mount on a host-provided listener.
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        router(Arc::clone(self))
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let header = header_map(&headers);
    ws.on_upgrade(move |socket| async move {
        if !hub.authorize(&header).await {
            debug!("connection rejected by authorize hook");
            return;
        }
        run_session(hub, socket).await;
    })
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

/// Drive one connection until it closes or errors.
///
/// Outbound frames flow through a bounded queue drained by a writer task;
/// inbound frames are processed one at a time, in arrival order, before the
/// next frame is read. With an idle timeout configured, a connection that
/// stays silent past the window is torn down with a `timeout` reason.
#[instrument(skip_all)]
pub async fn run_session(hub: Arc<Hub>, socket: WebSocket) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(hub.config().outbound_queue);
    let peer = hub.accept(tx).await;

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let idle_timeout = hub.config().idle_timeout_ms.map(Duration::from_millis);
    let reason = loop {
        let frame = if let Some(window) = idle_timeout {
            match tokio::time::timeout(window, ws_rx.next()).await {
                Ok(frame) => frame,
                Err(_elapsed) => {
                    debug!(peer_id = %peer.id, idle_ms = window.as_millis(), "idle timeout");
                    break DisconnectReason::Timeout;
                }
            }
        } else {
            ws_rx.next().await
        };
        match frame {
            Some(Ok(Message::Text(text))) => {
                hub.handle_text(&peer, text.as_str()).await;
            }
            Some(Ok(Message::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                Ok(text) => hub.handle_text(&peer, text).await,
                Err(_) => {
                    debug!(peer_id = %peer.id, "non-utf8 binary frame ignored");
                }
            },
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => break DisconnectReason::Close,
            Some(Err(error)) => {
                warn!(peer_id = %peer.id, %error, "websocket receive error");
                break DisconnectReason::Error;
            }
        }
    };

    hub.teardown(&peer.id, reason).await;
    writer.abort();
}
