//! Command handlers, one per target

mod client;
mod device;
mod mesh;
mod module;

pub use client::handle_client_notify;
pub use device::{handle_device_async, handle_device_status, handle_device_sync};
pub use mesh::handle_mesh;
pub use module::handle_module;

use super::Request;
use crate::connection::PeerRegistry;
use crate::device::{DeviceSession, Interrupt};
use crate::transport::MeshBridge;
use std::sync::Arc;
use tokio::sync::{watch, Notify};

/// Shared services handed to every handler
#[derive(Clone)]
pub struct HandlerContext {
    pub device: Arc<DeviceSession>,
    pub mesh: Arc<MeshBridge>,
    pub peers: Arc<PeerRegistry>,
    /// Flips to true once the gateway starts shutting down
    pub terminate: watch::Receiver<bool>,
    /// Signalled by `module:sync:terminate`
    pub shutdown: Arc<Notify>,
}

impl HandlerContext {
    pub fn new(
        device: Arc<DeviceSession>,
        mesh: Arc<MeshBridge>,
        peers: Arc<PeerRegistry>,
        terminate: watch::Receiver<bool>,
        shutdown: Arc<Notify>,
    ) -> Self {
        Self {
            device,
            mesh,
            peers,
            terminate,
            shutdown,
        }
    }

    /// Wait interruption for a request: termination, or its origin leaving
    pub fn interrupt_for(&self, request: &Request) -> Interrupt {
        Interrupt::new(self.terminate.clone(), Some(request.origin.clone()))
    }
}
