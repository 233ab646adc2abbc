//! Registry of known devices
//!
//! Records only describe how to reach a device. Live sockets belong to the
//! [`DeviceSession`](super::DeviceSession).

use gateway_shared::defaults;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

fn default_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(192, 168, 10, 1))
}

fn default_command_port() -> u16 {
    defaults::DEVICE_COMMAND_PORT
}

fn default_telemetry_port() -> u16 {
    defaults::DEVICE_TELEMETRY_PORT
}

/// How to reach one device
///
/// Deserializes from TOML (`[[devices]]`) and from the `addDevice` JSON
/// payload, which uses camelCase port names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    /// Access point the device hosts; absent when the host is already on its network
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default = "default_ip")]
    pub ip: IpAddr,
    #[serde(default = "default_command_port", alias = "commandPort")]
    pub command_port: u16,
    #[serde(default = "default_telemetry_port", alias = "telemetryPort")]
    pub telemetry_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl DeviceRecord {
    /// Record for a device already reachable at `ip`, on the default ports
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ssid: None,
            mac: None,
            ip,
            command_port: default_command_port(),
            telemetry_port: default_telemetry_port(),
            password: None,
        }
    }

    pub fn with_ssid(mut self, ssid: impl Into<String>) -> Self {
        self.ssid = Some(ssid.into());
        self
    }

    pub fn with_ports(mut self, command_port: u16, telemetry_port: u16) -> Self {
        self.command_port = command_port;
        self.telemetry_port = telemetry_port;
        self
    }
}

impl Default for DeviceRecord {
    fn default() -> Self {
        Self::new("D2D555", default_ip()).with_ssid("TELLO-D2D555")
    }
}

/// Ordered set of device records, unique by name
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    records: Vec<DeviceRecord>,
}

impl DeviceRegistry {
    pub fn new(records: Vec<DeviceRecord>) -> Self {
        let mut registry = Self::default();
        for record in records {
            registry.add(record);
        }
        registry
    }

    /// Add a record, replacing one with the same name
    ///
    /// Returns true when an existing record was replaced.
    pub fn add(&mut self, record: DeviceRecord) -> bool {
        match self.records.iter_mut().find(|r| r.name == record.name) {
            Some(existing) => {
                *existing = record;
                true
            }
            None => {
                self.records.push(record);
                false
            }
        }
    }

    pub fn find(&self, name: &str) -> Option<&DeviceRecord> {
        self.records.iter().find(|r| r.name == name)
    }

    pub fn first(&self) -> Option<&DeviceRecord> {
        self.records.first()
    }

    /// Remember the address a device was reached at after association
    pub fn update_ip(&mut self, name: &str, ip: IpAddr) {
        if let Some(record) = self.records.iter_mut().find(|r| r.name == name) {
            record.ip = ip;
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.records.iter().map(|r| r.name.clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.records.len()
    }
}
