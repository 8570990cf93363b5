// src/client.rs
use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use olaf_proto::{
    fingerprint, secret, ChatPayload, ChatSegment, Identity, Payload, SignedEnvelope, WireMessage,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::events::{self, BufferedMessage, ClientState};

/// The read half of the connection, reduced to text frames.
pub struct Incoming {
    stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
}

impl Incoming {
    /// Next text frame, or None once the connection is gone.
    pub async fn next_text(&mut self) -> Option<String> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) => return None,
                Ok(_) => {} // ping/pong/binary
                Err(e) => {
                    debug!("connection error: {e}");
                    return None;
                }
            }
        }
    }
}

/// A chat participant: one keypair, one connection to its home server, and
/// the local view the console reads (user list and message buffer).
pub struct Client {
    identity: Identity,
    outgoing: mpsc::UnboundedSender<String>,
    state: ClientState,
    counter: u64,
}

impl Client {
    /// Connect with a fresh keypair.
    pub async fn connect(host: &str, port: u16) -> Result<(Self, Incoming)> {
        let identity =
            Identity::generate().map_err(|e| anyhow!("could not generate keypair: {e}"))?;
        Self::connect_with_identity(identity, host, port).await
    }

    /// Connect reusing an existing identity.
    pub async fn connect_with_identity(
        identity: Identity,
        host: &str,
        port: u16,
    ) -> Result<(Self, Incoming)> {
        let url = format!("ws://{host}:{port}/ws");
        let (ws, _response) = connect_async(url.as_str())
            .await
            .with_context(|| format!("cannot connect to {url}"))?;
        info!(%url, "connected to home server");

        let (mut sink, stream) = ws.split();
        let (outgoing, mut rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let mut state = ClientState::default();
        state.connected = true;

        Ok((
            Self { identity, outgoing, state, counter: 0 },
            Incoming { stream },
        ))
    }

    pub fn fingerprint(&self) -> &str {
        self.identity.fingerprint()
    }

    pub fn public_pem_b64(&self) -> &str {
        self.identity.public_pem_b64()
    }

    pub fn hello_acked(&self) -> bool {
        self.state.hello_acked
    }

    /// public key -> home server address, as last pushed by the server.
    pub fn user_list(&self) -> &HashMap<String, String> {
        &self.state.user_list
    }

    pub fn messages(&self) -> &[BufferedMessage] {
        &self.state.buffer
    }

    /// Request service: announce our public key.
    pub fn hello(&mut self) -> Result<()> {
        let payload = Payload::Hello {
            public_key: self.identity.public_pem_b64().to_string(),
        };
        self.send_signed(&payload)
    }

    pub fn request_client_list(&self) -> Result<()> {
        self.send_frame(WireMessage::ClientListRequest {}.to_text())
    }

    /// Broadcast to every client in the neighbourhood.
    pub fn public_chat(&mut self, message: &str) -> Result<()> {
        let payload = Payload::PublicChat {
            sender: self.identity.fingerprint().to_string(),
            message: message.to_string(),
        };
        self.send_signed(&payload)
    }

    /// Encrypted group message to the given recipients (base64-PEM public
    /// keys). Destination servers are resolved from the user list; our own
    /// key is wrapped too so echoes stay readable.
    pub fn chat(&mut self, message: &str, recipient_keys: &[String]) -> Result<()> {
        let mut participants = vec![self.identity.fingerprint().to_string()];
        let mut wrap_keys = vec![self.identity.public_pem_b64().to_string()];
        let mut destinations = Vec::new();

        for key in recipient_keys {
            participants.push(fingerprint(key));
            wrap_keys.push(key.clone());
            match self.state.user_list.get(key) {
                Some(addr) => destinations.push(addr.clone()),
                None => warn!("no home server known for a recipient, they will miss this message"),
            }
        }
        destinations.sort();
        destinations.dedup();

        let segment = ChatSegment { participants, message: message.to_string() };
        let sealed = secret::seal_segment(&segment, &wrap_keys)
            .map_err(|e| anyhow!("could not encrypt chat: {e}"))?;

        let payload = Payload::Chat(ChatPayload {
            destination_servers: destinations,
            iv: sealed.iv,
            symm_keys: sealed.symm_keys,
            chat: sealed.chat,
        });
        self.send_signed(&payload)
    }

    /// Feed one inbound frame through the processing pipeline.
    pub fn handle_frame(&mut self, text: &str) {
        events::handle_frame(&mut self.state, &self.identity, text);
    }

    /// Drive the connection until it closes, logging messages as they land.
    pub async fn run(&mut self, mut incoming: Incoming) {
        while let Some(text) = incoming.next_text().await {
            let seen = self.state.buffer.len();
            self.handle_frame(&text);
            for msg in &self.state.buffer[seen..] {
                info!(
                    from = %msg.sender,
                    to = %msg.participants.join(", "),
                    "{}",
                    msg.text
                );
            }
        }
        info!("connection closed");
        self.state.connected = false;
    }

    fn send_signed(&mut self, payload: &Payload) -> Result<()> {
        self.counter += 1;
        let env = SignedEnvelope::create(payload, self.counter, self.identity.private())
            .map_err(|e| anyhow!("could not sign message: {e}"))?;
        self.send_frame(WireMessage::SignedData(env).to_text())
    }

    fn send_frame(&self, text: String) -> Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| anyhow!("connection to server is gone"))
    }
}
