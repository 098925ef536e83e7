//! Peer side of sshx: tunnels between hosts that can only reach each other
//! through NAT, negotiated over a mailbox relay.

pub mod adapter;
pub mod client;
pub mod config;
pub mod direct;
pub mod mux;
pub mod negotiation;
pub mod node;
pub mod pair;
pub mod pool;
pub mod signaling;
pub mod telemetry;

use std::time::{SystemTime, UNIX_EPOCH};

pub use node::{Node, NodeError};

/// Unix epoch milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
