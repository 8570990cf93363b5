// src/net.rs
//
// Socket plumbing. Inbound connections arrive through the axum WebSocket
// upgrade; outbound peer links are dialed with tokio-tungstenite. Every
// socket gets one writer task draining an unbounded queue, so the event
// loop only ever enqueues.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as PeerMessage;
use tracing::{debug, warn};

use crate::events::Event;
use crate::metrics;

/// Frames larger than this are dropped before parsing.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Shared handles the HTTP layer needs to hand sockets to the event loop.
#[derive(Clone)]
pub struct NodeShared {
    pub events: mpsc::UnboundedSender<Event>,
    pub shutdown: broadcast::Sender<()>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(shared): Extension<NodeShared>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        handle_inbound(socket, shared.events.clone(), shared.shutdown.subscribe())
    })
}

/// Drive one inbound connection until it closes or the node shuts down.
async fn handle_inbound(
    socket: WebSocket,
    events: mpsc::UnboundedSender<Event>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let conn = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    if events.send(Event::InboundOpen { conn, tx }).is_err() {
        return;
    }
    metrics::connection_opened();

    let (mut sink, mut stream) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        warn!(conn, bytes = text.len(), "oversized frame dropped");
                        continue;
                    }
                    metrics::frame_received();
                    if events.send(Event::InboundFrame { conn, text }).is_err() {
                        break;
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong/binary
                Some(Err(e)) => {
                    debug!(conn, "inbound socket error: {e}");
                    break;
                }
            }
        }
    }

    let _ = events.send(Event::InboundClosed { conn });
    metrics::connection_closed();
    writer.abort();
}

/// Dial a peer in the background. The attempt reports back to the event
/// loop as `OutboundOpen` on success or `OutboundClosed` on any failure, so
/// the caller only has to mark the address as dialing.
pub fn dial(
    addr: String,
    events: mpsc::UnboundedSender<Event>,
    mut shutdown: broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let url = format!("ws://{addr}/ws");
        let attempt = tokio::select! {
            _ = shutdown.recv() => {
                let _ = events.send(Event::OutboundClosed { addr });
                return;
            }
            result = connect_async(url.as_str()) => result,
        };
        let ws = match attempt {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(peer = %addr, "dial failed: {e}");
                let _ = events.send(Event::OutboundClosed { addr });
                return;
            }
        };

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        if events.send(Event::OutboundOpen { addr: addr.clone(), tx }).is_err() {
            return;
        }

        let writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(PeerMessage::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        // Peers answer on their own outbound link, so nothing substantive
        // arrives here; drain until the socket dies.
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                frame = stream.next() => match frame {
                    Some(Ok(PeerMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(peer = %addr, "outbound socket error: {e}");
                        break;
                    }
                }
            }
        }

        writer.abort();
        let _ = events.send(Event::OutboundClosed { addr });
    });
}

/// Periodic `Sweep` events drive startup dials and reconnects. The first
/// tick fires immediately.
pub fn spawn_sweeper(
    events: mpsc::UnboundedSender<Event>,
    mut shutdown: broadcast::Receiver<()>,
    period: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {
                    if events.send(Event::Sweep).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
