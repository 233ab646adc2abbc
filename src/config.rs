//! Gateway configuration
//!
//! Loaded from a TOML file; every section and field is optional and falls
//! back to the protocol defaults. Command-line flags override file values.
//!
//! ```toml
//! [gateway]
//! port = 5963
//! request_timeout_ms = 10000
//!
//! [mesh]
//! port = 42001
//! auto_start = true
//!
//! [wifi]
//! backend = "nmcli"
//! interface = "wlan0"
//!
//! [[devices]]
//! name = "D2D555"
//! ssid = "TELLO-D2D555"
//! ```

use crate::device::DeviceRecord;
use anyhow::{Context, Result};
use gateway_shared::defaults;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub gateway: GatewaySettings,
    pub mesh: MeshConfig,
    pub wifi: WifiConfig,
    pub devices: Vec<DeviceRecord>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway: GatewaySettings::default(),
            mesh: MeshConfig::default(),
            wifi: WifiConfig::default(),
            devices: vec![DeviceRecord::default()],
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: GatewayConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// WebSocket listener and device timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    pub bind: IpAddr,
    pub port: u16,
    pub request_timeout_ms: u64,
    pub handshake_retries: u32,
    pub bind_timeout_ms: u64,
    /// Local address the device UDP sockets bind to
    pub device_bind: IpAddr,
    /// Local command socket port, 0 for ephemeral
    pub local_command_port: u16,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: defaults::WEBSOCKET_PORT,
            request_timeout_ms: defaults::RESPONSE_TIMEOUT_MS,
            handshake_retries: defaults::HANDSHAKE_RETRIES,
            bind_timeout_ms: defaults::BIND_TIMEOUT_MS,
            device_bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_command_port: 0,
        }
    }
}

impl GatewaySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn bind_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_timeout_ms)
    }
}

/// Embedded mesh server and the bridge's default remote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    pub bind: IpAddr,
    pub port: u16,
    /// Start the embedded server at launch instead of on `mesh:sync:start`
    pub auto_start: bool,
    /// Host used by `mesh:sync:connect` without an argument
    pub host: String,
    pub connect_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: defaults::MESH_PORT,
            auto_start: false,
            host: "127.0.0.1".to_string(),
            connect_timeout_ms: 3000,
        }
    }
}

impl MeshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum WifiBackend {
    /// The host is already on the device network
    #[default]
    Static,
    /// Drive NetworkManager through `nmcli`
    Nmcli,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WifiConfig {
    pub backend: WifiBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Access point passwords by SSID
    pub passwords: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway.port, 5963);
        assert_eq!(config.mesh.port, 42001);
        assert_eq!(config.gateway.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.wifi.backend, WifiBackend::Static);
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].ssid.as_deref(), Some("TELLO-D2D555"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [gateway]
            port = 6000

            [wifi]
            backend = "nmcli"
            interface = "wlan1"

            [[devices]]
            name = "lab"
            ip = "10.0.0.5"
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.port, 6000);
        assert_eq!(config.gateway.handshake_retries, defaults::HANDSHAKE_RETRIES);
        assert_eq!(config.mesh, MeshConfig::default());
        assert_eq!(config.wifi.backend, WifiBackend::Nmcli);
        assert_eq!(config.wifi.interface.as_deref(), Some("wlan1"));
        assert_eq!(config.devices.len(), 1);
        assert_eq!(config.devices[0].command_port, 8889);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = GatewayConfig::default();
        config.wifi.passwords.insert("TELLO-D2D555".into(), "secret".into());
        config.mesh.auto_start = true;

        let text = config.to_toml().unwrap();
        let parsed: GatewayConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[mesh]\nauto_start = true\nport = 42010").unwrap();

        let config = GatewayConfig::load(file.path()).await.unwrap();
        assert!(config.mesh.auto_start);
        assert_eq!(config.mesh.port, 42010);
        assert_eq!(config.gateway, GatewaySettings::default());
    }

    #[tokio::test]
    async fn test_load_missing_file_fails() {
        let result = GatewayConfig::load("/nonexistent/gateway.toml").await;
        assert!(result.is_err());
    }
}
