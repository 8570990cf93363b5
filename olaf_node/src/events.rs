// src/events.rs
//
// The event loop. Every socket task funnels into one mpsc channel; this
// task owns `ServerState` outright, so directory and table mutations are
// totally ordered and no lock exists to hold across an await.
use olaf_proto::{Payload, SignedEnvelope, WireMessage};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::net;
use crate::state::{ConnId, Origin, Removed, ServerState};

/// Everything that can happen to a node, serialized into one stream.
pub enum Event {
    InboundOpen { conn: ConnId, tx: mpsc::UnboundedSender<String> },
    InboundFrame { conn: ConnId, text: String },
    InboundClosed { conn: ConnId },
    OutboundOpen { addr: String, tx: mpsc::UnboundedSender<String> },
    OutboundClosed { addr: String },
    /// Periodic reconnect sweep over the configured neighbourhood.
    Sweep,
}

/// Handles the event loop hands to spawned tasks.
pub struct Ctx {
    pub events: mpsc::UnboundedSender<Event>,
    pub neighbourhood: Vec<String>,
    pub shutdown: broadcast::Sender<()>,
}

pub async fn run(mut state: ServerState, mut rx: mpsc::UnboundedReceiver<Event>, ctx: Ctx) {
    while let Some(event) = rx.recv().await {
        handle_event(&mut state, &ctx, event);
    }
    debug!("event channel closed, event loop exiting");
}

/// One state transition. Synchronous on purpose: every send below is an
/// unbounded enqueue, so no handler ever blocks on the network.
pub fn handle_event(state: &mut ServerState, ctx: &Ctx, event: Event) {
    match event {
        Event::InboundOpen { conn, tx } => {
            debug!(conn, "connection opened");
            state.register_conn(conn, tx);
        }
        Event::InboundFrame { conn, text } => handle_frame(state, ctx, conn, &text),
        Event::InboundClosed { conn } => handle_closed(state, conn),
        Event::OutboundOpen { addr, tx } => {
            state.dialing.remove(&addr);
            if state.outbound.insert(addr.clone(), tx).is_none() {
                crate::metrics::peer_link_up();
            }
            info!(peer = %addr, "outbound peer link up");

            let hello = Payload::ServerHello { sender: state.self_addr.clone() };
            let counter = state.next_counter();
            match SignedEnvelope::create(&hello, counter, state.identity.private()) {
                Ok(env) => {
                    state.send_to_peer(&addr, &WireMessage::SignedData(env).to_text());
                }
                Err(e) => warn!(peer = %addr, "could not sign server_hello: {e}"),
            }
            state.send_to_peer(&addr, &WireMessage::ClientUpdateRequest {}.to_text());
        }
        Event::OutboundClosed { addr } => {
            state.dialing.remove(&addr);
            if state.purge_peer(&addr) {
                warn!(peer = %addr, "outbound peer link down, directory purged");
                state.broadcast_clients(&state.client_list_message().to_text());
            } else {
                debug!(peer = %addr, "dial failed or link already gone");
            }
        }
        Event::Sweep => {
            for addr in &ctx.neighbourhood {
                if *addr == state.self_addr
                    || state.outbound.contains_key(addr)
                    || state.dialing.contains(addr)
                {
                    continue;
                }
                state.dialing.insert(addr.clone());
                net::dial(addr.clone(), ctx.events.clone(), ctx.shutdown.subscribe());
            }
        }
    }
}

fn handle_frame(state: &mut ServerState, ctx: &Ctx, conn: ConnId, text: &str) {
    let message = match WireMessage::from_text(text) {
        Ok(m) => m,
        Err(e) => {
            debug!(conn, "dropping malformed frame: {e}");
            return;
        }
    };

    match message {
        WireMessage::SignedData(env) => handle_signed(state, ctx, conn, env, text),

        WireMessage::ClientListRequest {} => {
            debug!(conn, "client list requested");
            state.send_to_conn(conn, &state.client_list_message().to_text());
        }

        WireMessage::ClientUpdate { clients } => {
            let Some(addr) = state.peer_addr_by_conn.get(&conn).cloned() else {
                warn!(conn, "client_update from a connection that never said server_hello");
                return;
            };
            info!(peer = %addr, clients = clients.len(), "client update received");
            state.apply_client_update(&addr, &clients);
            state.broadcast_clients(&state.client_list_message().to_text());
        }

        WireMessage::ClientUpdateRequest {} => {
            let Some(addr) = state.peer_addr_by_conn.get(&conn).cloned() else {
                warn!(conn, "client_update_request from an unrecognised peer");
                return;
            };
            if !state.send_to_peer(&addr, &state.client_update_message().to_text()) {
                warn!(peer = %addr, "no outbound socket to answer client_update_request on");
            }
        }

        WireMessage::ClientList { .. } | WireMessage::HelloAck {} => {
            debug!(conn, "ignoring server-to-client frame arriving inbound");
        }
    }
}

fn handle_signed(
    state: &mut ServerState,
    ctx: &Ctx,
    conn: ConnId,
    env: SignedEnvelope,
    raw: &str,
) {
    let origin = state.origin_of(conn);
    if state.seen_recently(origin, &env.id) {
        debug!(conn, id = %env.id, "duplicate envelope, dropping");
        crate::metrics::duplicate_dropped();
        return;
    }
    let payload = match env.payload() {
        Ok(p) => p,
        Err(e) => {
            debug!(conn, "dropping signed envelope with bad payload: {e}");
            return;
        }
    };

    match payload {
        Payload::Hello { public_key } => {
            if origin == Origin::Peer {
                warn!(conn, "hello from a peer connection, dropping");
                return;
            }
            // Accepted locally: verify before the key enters the directory.
            // The presented key is the candidate; that covers first contact.
            if !env.verify_any([public_key.as_str()]) {
                warn!(conn, "hello signature did not verify, dropping");
                return;
            }
            info!(conn, "client hello accepted");
            state.promote_client(conn, public_key);
            state.send_to_conn(conn, &WireMessage::HelloAck {}.to_text());
            gossip_membership(state);
        }

        Payload::ServerHello { sender } => {
            if origin == Origin::Client {
                warn!(conn, "server_hello from a client connection, dropping");
                return;
            }
            info!(conn, peer = %sender, "server hello received");
            state.peer_addr_by_conn.insert(conn, sender.clone());
            // Dial back so both sides hold an outbound socket. Our own
            // server_hello and client_update_request go out once the link
            // is up. On an already-established link, ask for the peer's
            // clients again: its first request may have raced our dial.
            if state.outbound.contains_key(&sender) {
                state.send_to_peer(&sender, &WireMessage::ClientUpdateRequest {}.to_text());
            } else if !state.dialing.contains(&sender) {
                state.dialing.insert(sender.clone());
                net::dial(sender, ctx.events.clone(), ctx.shutdown.subscribe());
            }
        }

        Payload::PublicChat { .. } => match origin {
            Origin::Client => {
                debug!(conn, "public chat from client, fanning out");
                state.broadcast_peers(raw);
                state.broadcast_clients(raw);
            }
            Origin::Peer => {
                debug!(conn, "public chat from peer, delivering to clients");
                state.broadcast_clients(raw);
            }
            Origin::Unknown => warn!(conn, "public chat from unidentified connection, dropping"),
        },

        Payload::Chat(chat) => match origin {
            Origin::Client => {
                let mut dests = chat.destination_servers;
                dests.sort();
                dests.dedup();
                for addr in dests {
                    if addr == state.self_addr {
                        state.broadcast_clients(raw);
                    } else if !state.send_to_peer(&addr, raw) {
                        warn!(peer = %addr, "no outbound connection for chat destination");
                    }
                }
            }
            Origin::Peer => {
                debug!(conn, "chat from peer, delivering to clients");
                state.broadcast_clients(raw);
            }
            Origin::Unknown => warn!(conn, "chat from unidentified connection, dropping"),
        },
    }
}

fn handle_closed(state: &mut ServerState, conn: ConnId) {
    match state.remove_conn(conn) {
        Removed::Client { .. } => {
            info!(conn, "client disconnected");
            gossip_membership(state);
        }
        Removed::Peer { addr } => {
            warn!(conn, peer = %addr, "peer connection closed");
            if state.purge_peer(&addr) {
                state.broadcast_clients(&state.client_list_message().to_text());
            }
        }
        Removed::Other => debug!(conn, "unidentified connection closed"),
    }
}

/// The local client table changed: tell every peer (full list) and refresh
/// every local client's view of the world.
fn gossip_membership(state: &mut ServerState) {
    state.broadcast_peers(&state.client_update_message().to_text());
    state.broadcast_clients(&state.client_list_message().to_text());
}

#[cfg(test)]
mod tests {
    use super::*;
    use olaf_proto::{ChatPayload, Identity};

    fn identity() -> Identity {
        static IDENTITY: std::sync::OnceLock<Identity> = std::sync::OnceLock::new();
        IDENTITY.get_or_init(|| Identity::generate().unwrap()).clone()
    }

    struct Harness {
        state: ServerState,
        ctx: Ctx,
        _events_rx: mpsc::UnboundedReceiver<Event>,
    }

    fn harness() -> Harness {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = broadcast::channel(1);
        Harness {
            state: ServerState::new("127.0.0.1:4678".into(), identity()),
            ctx: Ctx { events, neighbourhood: Vec::new(), shutdown },
            _events_rx,
        }
    }

    fn open_conn(h: &mut Harness, conn: ConnId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle_event(&mut h.state, &h.ctx, Event::InboundOpen { conn, tx });
        rx
    }

    fn open_outbound(h: &mut Harness, addr: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        handle_event(
            &mut h.state,
            &h.ctx,
            Event::OutboundOpen { addr: addr.to_string(), tx },
        );
        rx
    }

    fn frame(h: &mut Harness, conn: ConnId, text: &str) {
        handle_event(&mut h.state, &h.ctx, Event::InboundFrame { conn, text: text.to_string() });
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(text);
        }
        out
    }

    fn hello_frame(id: &Identity, counter: u64) -> String {
        let env = SignedEnvelope::create(
            &Payload::Hello { public_key: id.public_pem_b64().to_string() },
            counter,
            id.private(),
        )
        .unwrap();
        WireMessage::SignedData(env).to_text()
    }

    fn mark_peer(h: &mut Harness, conn: ConnId, addr: &str) {
        h.state.peer_addr_by_conn.insert(conn, addr.to_string());
    }

    #[tokio::test]
    async fn hello_promotes_acks_and_gossips() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        drain(&mut peer_rx); // server_hello + client_update_request on link-up

        frame(&mut h, 1, &hello_frame(&id, 1));

        assert_eq!(
            h.state.directory.get(id.public_pem_b64()).map(String::as_str),
            Some("127.0.0.1:4678")
        );
        let to_client = drain(&mut client_rx);
        assert!(to_client.iter().any(|t| t.contains(r#""type":"hello"#)));
        assert!(to_client.iter().any(|t| t.contains(r#""type":"client_list"#)));
        let to_peer = drain(&mut peer_rx);
        assert!(to_peer.iter().any(|t| t.contains(r#""type":"client_update"#)));
    }

    #[tokio::test]
    async fn hello_with_bad_signature_is_dropped() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);

        let mut env = SignedEnvelope::create(
            &Payload::Hello { public_key: id.public_pem_b64().to_string() },
            1,
            id.private(),
        )
        .unwrap();
        env.counter = "999".into(); // signature no longer covers this
        frame(&mut h, 1, &WireMessage::SignedData(env).to_text());

        assert!(h.state.local_clients.is_empty());
        assert!(drain(&mut client_rx).is_empty());
    }

    #[tokio::test]
    async fn public_chat_from_client_fans_to_peers_and_clients() {
        let mut h = harness();
        let id = identity();
        let mut a_rx = open_conn(&mut h, 1);
        let mut b_rx = open_conn(&mut h, 2);
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        frame(&mut h, 1, &hello_frame(&id, 1));
        frame(&mut h, 2, &hello_frame(&identity(), 1));
        drain(&mut a_rx);
        drain(&mut b_rx);
        drain(&mut peer_rx);

        let env = SignedEnvelope::create(
            &Payload::PublicChat {
                sender: id.fingerprint().to_string(),
                message: "hi".into(),
            },
            2,
            id.private(),
        )
        .unwrap();
        let text = WireMessage::SignedData(env).to_text();
        frame(&mut h, 1, &text);

        // forwarded verbatim in every direction, sender included
        assert!(drain(&mut a_rx).contains(&text));
        assert!(drain(&mut b_rx).contains(&text));
        assert!(drain(&mut peer_rx).contains(&text));
    }

    #[tokio::test]
    async fn public_chat_from_peer_reaches_clients_only() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        drain(&mut client_rx);

        open_conn(&mut h, 7);
        mark_peer(&mut h, 7, "peer-a:1");
        let mut other_peer = open_outbound(&mut h, "peer-b:2");
        drain(&mut other_peer);

        let env = SignedEnvelope::create(
            &Payload::PublicChat { sender: "fp".into(), message: "from afar".into() },
            5,
            id.private(),
        )
        .unwrap();
        let text = WireMessage::SignedData(env).to_text();
        frame(&mut h, 7, &text);

        assert!(drain(&mut client_rx).contains(&text));
        assert!(drain(&mut other_peer).is_empty());
    }

    #[tokio::test]
    async fn chat_is_forwarded_to_destinations_and_delivered_for_self() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        drain(&mut client_rx);
        drain(&mut peer_rx);

        let env = SignedEnvelope::create(
            &Payload::Chat(ChatPayload {
                // duplicate entry exercises the dedup, self exercises local delivery
                destination_servers: vec![
                    "peer-a:1".into(),
                    "peer-a:1".into(),
                    "127.0.0.1:4678".into(),
                ],
                iv: "aXY=".into(),
                symm_keys: vec!["a2V5".into()],
                chat: "Y2lwaGVydGV4dA==".into(),
            }),
            2,
            id.private(),
        )
        .unwrap();
        let text = WireMessage::SignedData(env).to_text();
        frame(&mut h, 1, &text);

        let to_peer = drain(&mut peer_rx);
        assert_eq!(to_peer.iter().filter(|t| **t == text).count(), 1);
        assert!(drain(&mut client_rx).contains(&text));
    }

    #[tokio::test]
    async fn chat_with_no_destinations_goes_nowhere() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        drain(&mut client_rx);
        drain(&mut peer_rx);

        let env = SignedEnvelope::create(
            &Payload::Chat(ChatPayload {
                destination_servers: vec![],
                iv: "aXY=".into(),
                symm_keys: vec![],
                chat: "Y2lwaGVydGV4dA==".into(),
            }),
            2,
            id.private(),
        )
        .unwrap();
        frame(&mut h, 1, &WireMessage::SignedData(env).to_text());

        assert!(drain(&mut peer_rx).is_empty());
        assert!(drain(&mut client_rx).is_empty());
    }

    #[tokio::test]
    async fn client_update_from_stranger_is_rejected() {
        let mut h = harness();
        open_conn(&mut h, 1);
        frame(&mut h, 1, r#"{"type":"client_update","clients":["k1"]}"#);
        assert!(h.state.directory.is_empty());
    }

    #[tokio::test]
    async fn client_update_from_peer_rewrites_partition_and_refreshes_clients() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        drain(&mut client_rx);

        open_conn(&mut h, 7);
        mark_peer(&mut h, 7, "peer-a:1");
        frame(&mut h, 7, r#"{"type":"client_update","clients":["k1","k2"]}"#);

        assert_eq!(h.state.directory.get("k1").map(String::as_str), Some("peer-a:1"));
        assert_eq!(h.state.directory.get("k2").map(String::as_str), Some("peer-a:1"));
        let refreshed = drain(&mut client_rx);
        assert!(refreshed.iter().any(|t| t.contains(r#""type":"client_list"#) && t.contains("k1")));
    }

    #[tokio::test]
    async fn client_update_request_is_answered_on_the_outbound_socket() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        drain(&mut client_rx);

        open_conn(&mut h, 7);
        mark_peer(&mut h, 7, "peer-a:1");
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        drain(&mut peer_rx);

        frame(&mut h, 7, r#"{"type":"client_update_request"}"#);
        let answers = drain(&mut peer_rx);
        assert!(answers
            .iter()
            .any(|t| t.contains(r#""type":"client_update"#) && t.contains(id.public_pem_b64())));
    }

    #[tokio::test]
    async fn server_hello_on_an_established_link_reasks_for_clients() {
        let mut h = harness();
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        drain(&mut peer_rx);

        open_conn(&mut h, 7);
        let env = SignedEnvelope::create(
            &Payload::ServerHello { sender: "peer-a:1".into() },
            1,
            identity().private(),
        )
        .unwrap();
        frame(&mut h, 7, &WireMessage::SignedData(env).to_text());

        assert_eq!(h.state.peer_addr_by_conn.get(&7).map(String::as_str), Some("peer-a:1"));
        let resent = drain(&mut peer_rx);
        assert!(resent.iter().any(|t| t.contains(r#""type":"client_update_request"#)));
    }

    #[tokio::test]
    async fn duplicate_envelope_from_same_direction_is_dropped() {
        let mut h = harness();
        let id = identity();
        let mut a_rx = open_conn(&mut h, 1);
        let mut b_rx = open_conn(&mut h, 2);
        frame(&mut h, 1, &hello_frame(&id, 1));
        frame(&mut h, 2, &hello_frame(&identity(), 1));
        drain(&mut a_rx);
        drain(&mut b_rx);

        let env = SignedEnvelope::create(
            &Payload::PublicChat { sender: id.fingerprint().into(), message: "once".into() },
            2,
            id.private(),
        )
        .unwrap();
        let text = WireMessage::SignedData(env).to_text();
        frame(&mut h, 1, &text);
        frame(&mut h, 1, &text);

        assert_eq!(drain(&mut b_rx).iter().filter(|t| **t == text).count(), 1);
    }

    #[tokio::test]
    async fn peer_close_purges_directory_and_tells_clients() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        drain(&mut client_rx);

        open_conn(&mut h, 7);
        mark_peer(&mut h, 7, "peer-a:1");
        open_outbound(&mut h, "peer-a:1");
        frame(&mut h, 7, r#"{"type":"client_update","clients":["k1"]}"#);
        drain(&mut client_rx);

        handle_event(&mut h.state, &h.ctx, Event::InboundClosed { conn: 7 });

        assert!(!h.state.directory.values().any(|a| a == "peer-a:1"));
        assert!(!h.state.outbound.contains_key("peer-a:1"));
        let refreshed = drain(&mut client_rx);
        assert!(refreshed.iter().any(|t| t.contains(r#""type":"client_list"#) && !t.contains("k1")));
    }

    #[tokio::test]
    async fn client_disconnect_regossips_membership() {
        let mut h = harness();
        let id = identity();
        let mut client_rx = open_conn(&mut h, 1);
        frame(&mut h, 1, &hello_frame(&id, 1));
        let mut peer_rx = open_outbound(&mut h, "peer-a:1");
        drain(&mut client_rx);
        drain(&mut peer_rx);

        handle_event(&mut h.state, &h.ctx, Event::InboundClosed { conn: 1 });

        assert!(h.state.directory.is_empty());
        let to_peer = drain(&mut peer_rx);
        assert!(to_peer
            .iter()
            .any(|t| t.contains(r#""type":"client_update"#) && t.contains(r#""clients":[]"#)));
    }
}
