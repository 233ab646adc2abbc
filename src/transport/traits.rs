//! WiFi adapter abstraction for pluggable association backends

use anyhow::Result;
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::sync::broadcast;

/// An access point found by a scan
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub ssid: String,
    pub bssid: Option<String>,
    /// Signal strength in percent, when the backend reports it
    pub signal: Option<u8>,
}

impl Network {
    pub fn named(ssid: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            bssid: None,
            signal: None,
        }
    }

    /// Match by SSID, or by BSSID ignoring case
    pub fn matches(&self, ssid_or_mac: &str) -> bool {
        self.ssid == ssid_or_mac
            || self
                .bssid
                .as_deref()
                .is_some_and(|b| b.eq_ignore_ascii_case(ssid_or_mac))
    }
}

/// Outcome of an association attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Association {
    pub success: bool,
    pub message: String,
    /// Address of the device side, when the backend can tell
    pub ip: Option<IpAddr>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub network: Option<Network>,
    pub ip: Option<IpAddr>,
}

/// Association changes observed by the adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiEvent {
    Connected { ssid: String },
    Disconnected { ssid: String },
}

/// Joins the access point a device hosts
#[async_trait]
pub trait WifiAdapter: Send + Sync {
    /// Scan and return the number of access points seen
    async fn init(&self) -> Result<usize>;

    /// Find a scanned network by SSID or MAC address
    async fn lookup(&self, ssid_or_mac: &str) -> Result<Option<Network>>;

    async fn connect(&self, network: &Network, password: Option<&str>) -> Result<Association>;

    /// Drop the current association; false when there was none
    async fn disconnect(&self) -> Result<bool>;

    async fn connection_state(&self) -> ConnectionState;

    fn subscribe(&self) -> broadcast::Receiver<WifiEvent>;

    /// Human-readable name for this backend
    fn name(&self) -> &'static str;
}
