//! Device link management
//!
//! This module provides:
//! - A registry of known devices
//! - The active device session (WiFi association and UDP sockets)
//! - Correlation of UDP replies with the commands that caused them
//! - The telemetry cache fed by the device's status stream

mod correlator;
mod registry;
mod session;
mod telemetry;

pub use correlator::Interrupt;
pub use registry::{DeviceRecord, DeviceRegistry};
pub use session::{DeviceSession, SessionSettings};

#[cfg(test)]
pub(crate) use session::test_settings;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not connected")]
    NotConnected,

    #[error("device {0} not registered")]
    UnknownDevice(String),

    #[error("no device registered")]
    NoDevices,

    #[error("WiFi down")]
    WifiDown,

    #[error("WiFi direct connect: {0} not found")]
    AccessPointNotFound(String),

    #[error("WiFi direct connect: {ssid}: {reason}")]
    Association { ssid: String, reason: String },

    #[error("WiFi adapter: {0}")]
    Wifi(String),

    #[error("bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("bind port {0}: timeout")]
    BindTimeout(u16),

    #[error("device command send error: {0}")]
    Send(#[source] std::io::Error),

    #[error("recv from device: response timeout")]
    ResponseTimeout,

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),
}
