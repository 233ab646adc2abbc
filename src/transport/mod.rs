//! Outbound links: WiFi association backends and the mesh bridge

mod mesh;
mod traits;
mod wifi;

pub use mesh::MeshBridge;
pub use traits::{Association, ConnectionState, Network, WifiAdapter, WifiEvent};
pub use wifi::{NmcliWifi, StaticWifi};
