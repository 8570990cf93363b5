// src/events.rs
//
// Inbound frame handling. Pure functions over `ClientState`, so the whole
// pipeline (dedupe, signature sweep, counter tracking, trial decryption)
// is testable without a socket in sight.
use std::collections::{HashMap, HashSet};

use olaf_proto::{fingerprint, secret, Identity, Payload, SignedEnvelope, WireMessage};
use tracing::{debug, info, warn};

/// One decrypted (or public) message as the console will read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedMessage {
    pub text: String,
    pub sender: String,
    pub participants: Vec<String>,
}

#[derive(Default)]
pub struct ClientState {
    pub connected: bool,
    pub hello_acked: bool,
    /// public key (base64-PEM) -> home server address.
    pub user_list: HashMap<String, String>,
    /// signer fingerprint -> last accepted counter.
    counters: HashMap<String, u64>,
    processed_ids: HashSet<String>,
    pub buffer: Vec<BufferedMessage>,
}

pub fn handle_frame(state: &mut ClientState, identity: &Identity, text: &str) {
    let message = match WireMessage::from_text(text) {
        Ok(m) => m,
        Err(e) => {
            debug!("dropping malformed frame: {e}");
            return;
        }
    };

    match message {
        WireMessage::HelloAck {} => {
            info!("server accepted the request for service");
            state.hello_acked = true;
        }
        WireMessage::ClientList { servers } => {
            state.user_list.clear();
            for record in servers {
                for key in record.clients {
                    state.user_list.insert(key, record.address.clone());
                }
            }
            debug!(users = state.user_list.len(), "user list replaced");
        }
        WireMessage::SignedData(env) => handle_chat(state, identity, env),
        WireMessage::ClientListRequest {}
        | WireMessage::ClientUpdate { .. }
        | WireMessage::ClientUpdateRequest {} => {
            debug!("ignoring server-to-server frame");
        }
    }
}

fn handle_chat(state: &mut ClientState, identity: &Identity, env: SignedEnvelope) {
    if !state.processed_ids.insert(env.id.clone()) {
        debug!(id = %env.id, "duplicate message, ignoring");
        return;
    }

    let counter = match env.counter_value() {
        Ok(c) => c,
        Err(_) => {
            debug!(id = %env.id, "counter is not a number, dropping");
            return;
        }
    };
    let payload = match env.payload() {
        Ok(p) => p,
        Err(e) => {
            debug!("dropping signed envelope with bad payload: {e}");
            return;
        }
    };

    match payload {
        Payload::PublicChat { sender, message } => {
            if !verify_envelope(state, Some(&sender), &env) {
                warn!("public chat signature did not verify against any known key");
                return;
            }
            if !accept_counter(state, &sender, counter) {
                debug!(%sender, counter, "stale counter on public chat");
                return;
            }
            state.buffer.push(BufferedMessage {
                text: message,
                sender,
                participants: vec!["Public".to_string()],
            });
        }

        Payload::Chat(chat) => {
            if !verify_envelope(state, None, &env) {
                warn!("chat signature did not verify against any known key");
                return;
            }
            let Some(segment) =
                secret::open_segment(identity.private(), &chat.iv, &chat.chat, &chat.symm_keys)
            else {
                // expected for traffic addressed to someone else
                debug!("could not decrypt chat segment, assuming not for me");
                return;
            };
            if segment.participants.is_empty() {
                debug!("chat segment without participants, dropping");
                return;
            }
            let sender = segment.participants[0].clone();
            if sender == identity.fingerprint() {
                debug!("own message echoed back, skipping");
                return;
            }
            if !accept_counter(state, &sender, counter) {
                debug!(%sender, counter, "stale counter on chat");
                return;
            }
            state.buffer.push(BufferedMessage {
                text: segment.message,
                sender,
                participants: segment.participants[1..].to_vec(),
            });
        }

        Payload::Hello { .. } | Payload::ServerHello { .. } => {
            debug!("ignoring handshake payload arriving as a chat");
        }
    }
}

/// Sweep every known key; when the signer's fingerprint is known, its key
/// goes first.
fn verify_envelope(state: &ClientState, sender_fp: Option<&str>, env: &SignedEnvelope) -> bool {
    if let Some(fp) = sender_fp {
        if let Some(key) = state.user_list.keys().find(|k| fingerprint(k) == fp) {
            if env.verify_any([key.as_str()]) {
                return true;
            }
        }
    }
    env.verify_any(state.user_list.keys().map(String::as_str))
}

/// Counters from one signer must strictly increase.
fn accept_counter(state: &mut ClientState, sender: &str, counter: u64) -> bool {
    match state.counters.get(sender) {
        Some(last) if counter <= *last => false,
        _ => {
            state.counters.insert(sender.to_string(), counter);
            true
        }
    }
}
