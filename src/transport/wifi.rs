//! WiFi adapter backends
//!
//! `StaticWifi` is for hosts already on the device network (or tests);
//! `NmcliWifi` drives NetworkManager through its command-line client.

use super::traits::{Association, ConnectionState, Network, WifiAdapter, WifiEvent};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::IpAddr;
use tokio::process::Command;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 16;

/// Adapter that "associates" without touching the radio
///
/// Without a network list every SSID resolves; with one, only listed
/// networks do.
pub struct StaticWifi {
    networks: Option<Vec<Network>>,
    device_ip: Option<IpAddr>,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<WifiEvent>,
}

impl StaticWifi {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            networks: None,
            device_ip: None,
            state: RwLock::new(ConnectionState::default()),
            events,
        }
    }

    /// Restrict lookups to a fixed scan result
    pub fn with_networks(mut self, networks: Vec<Network>) -> Self {
        self.networks = Some(networks);
        self
    }

    /// Address reported for the device once associated
    pub fn with_device_ip(mut self, ip: IpAddr) -> Self {
        self.device_ip = Some(ip);
        self
    }
}

impl Default for StaticWifi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WifiAdapter for StaticWifi {
    async fn init(&self) -> Result<usize> {
        Ok(self.networks.as_ref().map_or(1, Vec::len))
    }

    async fn lookup(&self, ssid_or_mac: &str) -> Result<Option<Network>> {
        Ok(match &self.networks {
            Some(networks) => networks.iter().find(|n| n.matches(ssid_or_mac)).cloned(),
            None => Some(Network::named(ssid_or_mac)),
        })
    }

    async fn connect(&self, network: &Network, _password: Option<&str>) -> Result<Association> {
        *self.state.write().await = ConnectionState {
            connected: true,
            network: Some(network.clone()),
            ip: self.device_ip,
        };
        let _ = self.events.send(WifiEvent::Connected {
            ssid: network.ssid.clone(),
        });

        Ok(Association {
            success: true,
            message: format!("connected to {}", network.ssid),
            ip: self.device_ip,
        })
    }

    async fn disconnect(&self) -> Result<bool> {
        let previous = std::mem::take(&mut *self.state.write().await);
        match previous.network {
            Some(network) if previous.connected => {
                let _ = self.events.send(WifiEvent::Disconnected { ssid: network.ssid });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<WifiEvent> {
        self.events.subscribe()
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// NetworkManager backend
pub struct NmcliWifi {
    interface: Option<String>,
    scanned: RwLock<Vec<Network>>,
    state: RwLock<ConnectionState>,
    events: broadcast::Sender<WifiEvent>,
}

impl NmcliWifi {
    pub fn new(interface: Option<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            interface,
            scanned: RwLock::new(Vec::new()),
            state: RwLock::new(ConnectionState::default()),
            events,
        }
    }

    /// Configured interface, else the first WiFi device NetworkManager knows
    async fn interface(&self) -> Result<String> {
        if let Some(interface) = &self.interface {
            return Ok(interface.clone());
        }
        let output = nmcli(&["-t", "-f", "DEVICE,TYPE", "device"]).await?;
        output
            .lines()
            .map(split_terse)
            .find(|fields| fields.get(1).map(String::as_str) == Some("wifi"))
            .and_then(|fields| fields.into_iter().next())
            .ok_or_else(|| anyhow!("no WiFi interface found"))
    }

    /// The access point hosts the device, so the lease gateway is its address
    async fn gateway_ip(&self, interface: &str) -> Option<IpAddr> {
        let output = nmcli(&["-t", "-f", "IP4.GATEWAY", "device", "show", interface])
            .await
            .ok()?;
        parse_field(&output, "IP4.GATEWAY").and_then(|v| v.parse().ok())
    }
}

#[async_trait]
impl WifiAdapter for NmcliWifi {
    async fn init(&self) -> Result<usize> {
        let mut args = vec!["-t", "-f", "SSID,BSSID,SIGNAL", "device", "wifi", "list", "--rescan", "yes"];
        let interface = self.interface.clone();
        if let Some(interface) = interface.as_deref() {
            args.extend(["ifname", interface]);
        }

        let output = nmcli(&args).await?;
        let networks = parse_wifi_list(&output);
        let count = networks.len();
        *self.scanned.write().await = networks;
        debug!("[WIFI] nmcli scan found {} networks", count);
        Ok(count)
    }

    async fn lookup(&self, ssid_or_mac: &str) -> Result<Option<Network>> {
        if self.scanned.read().await.is_empty() {
            self.init().await?;
        }
        let scanned = self.scanned.read().await;
        Ok(scanned.iter().find(|n| n.matches(ssid_or_mac)).cloned())
    }

    async fn connect(&self, network: &Network, password: Option<&str>) -> Result<Association> {
        let interface = self.interface().await?;
        let target = network.bssid.as_deref().unwrap_or(&network.ssid);

        let mut args = vec!["device", "wifi", "connect", target];
        if let Some(password) = password {
            args.extend(["password", password]);
        }
        args.extend(["ifname", interface.as_str()]);

        match nmcli(&args).await {
            Ok(output) => {
                let ip = self.gateway_ip(&interface).await;
                info!("[WIFI] Associated with {} on {}", network.ssid, interface);
                *self.state.write().await = ConnectionState {
                    connected: true,
                    network: Some(network.clone()),
                    ip,
                };
                let _ = self.events.send(WifiEvent::Connected {
                    ssid: network.ssid.clone(),
                });
                Ok(Association {
                    success: true,
                    message: output.trim().to_string(),
                    ip,
                })
            }
            Err(e) => {
                warn!("[WIFI] Association with {} failed: {}", network.ssid, e);
                Ok(Association {
                    success: false,
                    message: e.to_string(),
                    ip: None,
                })
            }
        }
    }

    async fn disconnect(&self) -> Result<bool> {
        let previous = std::mem::take(&mut *self.state.write().await);
        let network = match previous.network {
            Some(network) if previous.connected => network,
            _ => return Ok(false),
        };

        nmcli(&["connection", "down", "id", &network.ssid]).await?;
        let _ = self.events.send(WifiEvent::Disconnected { ssid: network.ssid });
        Ok(true)
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<WifiEvent> {
        self.events.subscribe()
    }

    fn name(&self) -> &'static str {
        "nmcli"
    }
}

async fn nmcli(args: &[&str]) -> Result<String> {
    let output = Command::new("nmcli")
        .args(args)
        .output()
        .await
        .context("failed to run nmcli")?;

    if !output.status.success() {
        return Err(anyhow!(
            "nmcli {}: {}",
            args.iter().find(|a| !a.starts_with('-')).unwrap_or(&""),
            String::from_utf8_lossy(&output.stderr).trim()
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Split one line of `nmcli -t` output on unescaped colons
fn split_terse(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            ':' => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    fields.push(current);
    fields
}

fn parse_wifi_list(output: &str) -> Vec<Network> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| {
            let fields = split_terse(line);
            let ssid = fields.first()?.clone();
            // Hidden networks have no SSID to join by
            if ssid.is_empty() {
                return None;
            }
            Some(Network {
                ssid,
                bssid: fields.get(1).filter(|b| !b.is_empty()).cloned(),
                signal: fields.get(2).and_then(|s| s.parse().ok()),
            })
        })
        .collect()
}

/// Value of the first `FIELD` or `FIELD[n]` line
fn parse_field(output: &str, field: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        let key = key.split('[').next().unwrap_or(key);
        (key == field && !value.is_empty()).then(|| value.to_string())
    })
}
