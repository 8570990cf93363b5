// src/lib.rs
pub mod client;
pub mod events;

pub use client::{Client, Incoming};
pub use events::BufferedMessage;
