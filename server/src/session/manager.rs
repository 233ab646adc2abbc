//! Peer manager for tracking all connected mesh peers

use super::connection::PeerHandle;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

struct PeerEntry {
    handle: PeerHandle,
    task: Option<JoinHandle<()>>,
}

/// Manages all live mesh peers
pub struct PeerManager {
    /// Map of connection id -> peer
    peers: RwLock<HashMap<u64, PeerEntry>>,
    next_id: AtomicU64,
}

impl PeerManager {
    /// Create a new peer manager
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate a connection id
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Register a newly accepted peer
    pub async fn register(&self, handle: PeerHandle) {
        let mut peers = self.peers.write().await;
        peers.insert(handle.id, PeerEntry { handle, task: None });
    }

    /// Remember the task serving a peer so it can be aborted on stop
    pub async fn attach_task(&self, id: u64, task: JoinHandle<()>) {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&id) {
            Some(entry) => entry.task = Some(task),
            // Session already ended
            None => drop(task),
        }
    }

    /// Unregister a peer
    pub async fn unregister(&self, id: u64) {
        let mut peers = self.peers.write().await;
        peers.remove(&id);
    }

    /// Queue frames for every live peer except the sender
    ///
    /// Returns the number of peers that accepted all frames. The peer table
    /// is only locked while collecting targets.
    pub async fn relay(&self, from: u64, frames: &[Bytes]) -> usize {
        let targets: Vec<PeerHandle> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|entry| entry.handle.id != from && entry.handle.is_alive())
                .map(|entry| entry.handle.clone())
                .collect()
        };

        let mut delivered = 0;
        for handle in targets {
            let mut ok = true;
            for frame in frames {
                if let Err(e) = handle.send(frame.clone()) {
                    debug!("[MESH] Failed to relay to peer {}: {}", handle.id, e);
                    ok = false;
                    break;
                }
            }
            if ok {
                delivered += 1;
            }
        }

        delivered
    }

    /// Drop every peer, aborting its session task
    pub async fn close_all(&self) {
        let entries: Vec<PeerEntry> = {
            let mut peers = self.peers.write().await;
            peers.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            if let Some(task) = entry.task {
                task.abort();
            }
            entry.handle.shutdown();
        }
    }

    /// Get the number of registered peers
    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }
}

impl Default for PeerManager {
    fn default() -> Self {
        Self::new()
    }
}
