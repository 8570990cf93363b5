// src/metrics.rs
use std::sync::atomic::{AtomicU64, Ordering};

/// Lightweight counters, updated from the socket tasks and the event loop.
static ACTIVE_CONNECTIONS: AtomicU64 = AtomicU64::new(0);
static PEER_LINKS: AtomicU64 = AtomicU64::new(0);
static FRAMES_IN: AtomicU64 = AtomicU64::new(0);
static DUPLICATES_DROPPED: AtomicU64 = AtomicU64::new(0);

pub fn connection_opened() {
    ACTIVE_CONNECTIONS.fetch_add(1, Ordering::Relaxed);
}

pub fn connection_closed() {
    ACTIVE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed);
}

pub fn peer_link_up() {
    PEER_LINKS.fetch_add(1, Ordering::Relaxed);
}

pub fn peer_link_down() {
    PEER_LINKS.fetch_sub(1, Ordering::Relaxed);
}

pub fn frame_received() {
    FRAMES_IN.fetch_add(1, Ordering::Relaxed);
}

pub fn duplicate_dropped() {
    DUPLICATES_DROPPED.fetch_add(1, Ordering::Relaxed);
}

/// (active connections, peer links, frames received, duplicates dropped)
pub fn snapshot() -> (u64, u64, u64, u64) {
    (
        ACTIVE_CONNECTIONS.load(Ordering::Relaxed),
        PEER_LINKS.load(Ordering::Relaxed),
        FRAMES_IN.load(Ordering::Relaxed),
        DUPLICATES_DROPPED.load(Ordering::Relaxed),
    )
}
