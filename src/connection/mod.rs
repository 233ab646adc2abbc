//! Front-end peer connections
//!
//! This module handles:
//! - The WebSocket listener and per-peer sessions
//! - The registry of live peers and response fan-out
//! - Flushing and closing sessions on shutdown

mod manager;
mod peer;
mod websocket;

pub use manager::PeerRegistry;
pub use peer::{PeerHandle, PeerId};
pub use websocket::{router, AppState};
