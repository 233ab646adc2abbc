//! Session management for tracking connected mesh peers
//!
//! This module handles:
//! - Accumulating inbound bytes into complete RSP frames
//! - Tracking every live peer and its protocol version tag
//! - Relaying frames to every peer except the sender

mod connection;
mod manager;

pub use connection::{MeshSession, PeerHandle};
pub use manager::PeerManager;
