// src/state.rs
//
// All mutable server state lives here, owned by the event loop task. Socket
// tasks never touch these tables; they only feed events in and drain their
// per-connection queues.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};

use olaf_proto::{Identity, ServerRecord, WireMessage};
use tokio::sync::mpsc;

pub type ConnId = u64;

const SEEN_WINDOW: Duration = Duration::from_secs(300);
const SEEN_PRUNE_EVERY: Duration = Duration::from_secs(30);

/// Which logical room an inbound connection is in. Everything starts as a
/// peer; a valid `hello` promotes to `Clients`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Room {
    Peers,
    Clients,
}

/// Where a frame came from, by the sender's current standing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Client,
    Peer,
    Unknown,
}

/// Handle to one inbound connection: its writer queue and room tag.
pub struct ConnHandle {
    pub tx: mpsc::UnboundedSender<String>,
    pub room: Room,
}

/// What a closed connection turned out to be.
pub enum Removed {
    Client { public_key: String },
    Peer { addr: String },
    Other,
}

pub struct ServerState {
    /// host:port this node advertises to the neighbourhood.
    pub self_addr: String,
    pub identity: Identity,

    pub conns: HashMap<ConnId, ConnHandle>,
    /// connection id -> base64-PEM public key of the client served on it.
    pub local_clients: HashMap<ConnId, String>,
    /// client public key -> owning server address (the directory).
    pub directory: HashMap<String, String>,
    /// inbound peer connection id -> the address it advertised.
    pub peer_addr_by_conn: HashMap<ConnId, String>,
    /// peer address -> outbound writer queue.
    pub outbound: HashMap<String, mpsc::UnboundedSender<String>>,
    /// addresses with a dial in flight.
    pub dialing: HashSet<String>,

    counter: u64,
    seen: HashMap<(Origin, String), Instant>,
    last_prune: Instant,
}

impl ServerState {
    pub fn new(self_addr: String, identity: Identity) -> Self {
        Self {
            self_addr,
            identity,
            conns: HashMap::new(),
            local_clients: HashMap::new(),
            directory: HashMap::new(),
            peer_addr_by_conn: HashMap::new(),
            outbound: HashMap::new(),
            dialing: HashSet::new(),
            counter: 0,
            seen: HashMap::new(),
            last_prune: Instant::now(),
        }
    }

    /// Next value of this node's own monotonic send counter.
    pub fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    pub fn origin_of(&self, conn: ConnId) -> Origin {
        if self.local_clients.contains_key(&conn) {
            Origin::Client
        } else if self.peer_addr_by_conn.contains_key(&conn) {
            Origin::Peer
        } else {
            Origin::Unknown
        }
    }

    /// Envelope-id dedupe, keyed by origin direction so a loop through the
    /// mesh is damped without eating a legitimate first delivery from the
    /// other side. Returns true if the id was already seen in the window.
    pub fn seen_recently(&mut self, origin: Origin, id: &str) -> bool {
        let now = Instant::now();
        if now.duration_since(self.last_prune) > SEEN_PRUNE_EVERY {
            self.seen.retain(|_, expiry| *expiry > now);
            self.last_prune = now;
        }
        let key = (origin, id.to_string());
        if let Some(expiry) = self.seen.get(&key) {
            if *expiry > now {
                return true;
            }
        }
        self.seen.insert(key, now + SEEN_WINDOW);
        false
    }

    pub fn register_conn(&mut self, conn: ConnId, tx: mpsc::UnboundedSender<String>) {
        self.conns.insert(conn, ConnHandle { tx, room: Room::Peers });
    }

    /// A valid `hello` moves the connection to the clients room and records
    /// its key. A repeated hello on the same connection replaces the
    /// recorded key; the superseded key leaves the directory.
    pub fn promote_client(&mut self, conn: ConnId, public_key: String) {
        if let Some(handle) = self.conns.get_mut(&conn) {
            handle.room = Room::Clients;
        }
        if let Some(old) = self.local_clients.insert(conn, public_key.clone()) {
            if old != public_key && self.owns_key(&old) {
                self.directory.remove(&old);
            }
        }
        self.directory.insert(public_key, self.self_addr.clone());
    }

    fn owns_key(&self, key: &str) -> bool {
        self.directory.get(key).map(|a| a == &self.self_addr).unwrap_or(false)
    }

    pub fn remove_conn(&mut self, conn: ConnId) -> Removed {
        self.conns.remove(&conn);
        if let Some(key) = self.local_clients.remove(&conn) {
            if self.owns_key(&key) {
                self.directory.remove(&key);
            }
            return Removed::Client { public_key: key };
        }
        if let Some(addr) = self.peer_addr_by_conn.remove(&conn) {
            return Removed::Peer { addr };
        }
        Removed::Other
    }

    /// Replace-by-peer-partition reconciliation: afterwards exactly the
    /// supplied keys map to `addr`. A key arriving under a new address
    /// overwrites its previous owner (last write wins).
    pub fn apply_client_update(&mut self, addr: &str, clients: &[String]) {
        self.directory.retain(|_, owner| owner != addr);
        for key in clients {
            self.directory.insert(key.clone(), addr.to_string());
        }
    }

    /// Tear down everything owned by a peer address. Returns true if any
    /// state actually changed (callers refresh local clients then).
    pub fn purge_peer(&mut self, addr: &str) -> bool {
        let had_outbound = self.outbound.remove(addr).is_some();
        if had_outbound {
            crate::metrics::peer_link_down();
        }
        self.dialing.remove(addr);
        let before = self.directory.len();
        self.directory.retain(|_, owner| owner != addr);
        had_outbound || self.directory.len() != before
    }

    /// Full directory snapshot grouped by server address, for clients.
    pub fn client_list_message(&self) -> WireMessage {
        let mut by_server: BTreeMap<&String, Vec<String>> = BTreeMap::new();
        for (key, addr) in &self.directory {
            by_server.entry(addr).or_default().push(key.clone());
        }
        let servers = by_server
            .into_iter()
            .map(|(address, mut clients)| {
                clients.sort();
                ServerRecord { address: address.clone(), clients }
            })
            .collect();
        WireMessage::ClientList { servers }
    }

    /// This node's current local client list, for peers.
    pub fn client_update_message(&self) -> WireMessage {
        let mut clients: Vec<String> = self.local_clients.values().cloned().collect();
        clients.sort();
        clients.dedup();
        WireMessage::ClientUpdate { clients }
    }

    pub fn send_to_conn(&self, conn: ConnId, text: &str) {
        if let Some(handle) = self.conns.get(&conn) {
            let _ = handle.tx.send(text.to_string());
        }
    }

    pub fn broadcast_clients(&self, text: &str) {
        for handle in self.conns.values().filter(|h| h.room == Room::Clients) {
            let _ = handle.tx.send(text.to_string());
        }
    }

    pub fn broadcast_peers(&self, text: &str) {
        for tx in self.outbound.values() {
            let _ = tx.send(text.to_string());
        }
    }

    /// Write on the outbound socket for `addr`. False if there is none.
    pub fn send_to_peer(&self, addr: &str, text: &str) -> bool {
        match self.outbound.get(addr) {
            Some(tx) => tx.send(text.to_string()).is_ok(),
            None => false,
        }
    }
}
