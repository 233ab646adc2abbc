//! Registry of live WebSocket peers

use super::peer::{PeerHandle, PeerId};
use gateway_shared::Response;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

/// Tracks every connected peer and fans responses out to them
pub struct PeerRegistry {
    peers: RwLock<HashMap<PeerId, PeerHandle>>,
    next_id: AtomicU64,
    /// Set once when the gateway closes; sessions flush and hang up
    shutdown: watch::Sender<bool>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            peers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Register a new peer and return its handle and response stream
    pub async fn register(&self) -> (PeerHandle, mpsc::UnboundedReceiver<Response>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (handle, rx) = PeerHandle::new(id);
        self.peers.write().await.insert(id, handle.clone());
        debug!("[WS] Peer {} registered", id);
        (handle, rx)
    }

    pub async fn unregister(&self, id: PeerId) {
        if let Some(handle) = self.peers.write().await.remove(&id) {
            handle.mark_dead();
            debug!("[WS] Peer {} unregistered", id);
        }
    }

    /// Push a response to every live peer
    pub async fn broadcast(&self, response: &Response) -> usize {
        self.broadcast_except(None, response).await
    }

    /// Push a response to every live peer other than `skip`
    pub async fn broadcast_except(&self, skip: Option<PeerId>, response: &Response) -> usize {
        let peers = self.peers.read().await;
        peers
            .values()
            .filter(|peer| Some(peer.id) != skip)
            .filter(|peer| peer.send(response.clone()))
            .count()
    }

    pub async fn live_count(&self) -> usize {
        self.peers
            .read()
            .await
            .values()
            .filter(|peer| peer.is_alive())
            .count()
    }

    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Ask every session to flush its pending responses and close
    pub async fn close_all(&self) {
        self.shutdown.send_replace(true);
        let count = self.peers.read().await.len();
        info!("[WS] Closing {} peer sessions", count);
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_broadcast_reaches_all_live_peers() {
        let registry = PeerRegistry::new();
        let (_a, mut rx_a) = registry.register().await;
        let (b, mut rx_b) = registry.register().await;
        let (_c, rx_c) = registry.register().await;
        drop(rx_c);

        let delivered = registry.broadcast(&Response::new(0, true, "hello")).await;
        assert_eq!(delivered, 2);
        assert_eq!(rx_a.recv().await.unwrap().message, "hello");
        assert_eq!(rx_b.recv().await.unwrap().message, "hello");

        let delivered = registry
            .broadcast_except(Some(b.id), &Response::new(0, true, "again"))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_marks_dead() {
        let registry = PeerRegistry::new();
        let (peer, _rx) = registry.register().await;
        assert_eq!(registry.live_count().await, 1);

        registry.unregister(peer.id).await;
        assert!(!peer.is_alive());
        assert_eq!(registry.live_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_all_signals_sessions() {
        let registry = PeerRegistry::new();
        let mut shutdown = registry.subscribe_shutdown();
        assert!(!registry.is_shutting_down());

        registry.close_all().await;
        shutdown.changed().await.unwrap();
        assert!(*shutdown.borrow());
        assert!(registry.is_shutting_down());
    }
}
