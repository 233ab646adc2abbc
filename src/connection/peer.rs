//! Handle to one WebSocket peer

use gateway_shared::Response;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

pub type PeerId = u64;

/// Cloneable sender side of a peer connection
///
/// Responses are queued to the peer's writer task. The live flag gates
/// every write; once cleared, sends are skipped rather than attempted.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: PeerId,
    tx: mpsc::UnboundedSender<Response>,
    alive: Arc<AtomicBool>,
}

impl PeerHandle {
    pub fn new(id: PeerId) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id,
            tx,
            alive: Arc::new(AtomicBool::new(true)),
        };
        (handle, rx)
    }

    /// Queue a response for this peer
    ///
    /// Returns false if the peer is dead and the response was skipped.
    pub fn send(&self, response: Response) -> bool {
        if !self.is_alive() {
            debug!("[WS] Peer {} is gone, skipping commID {}", self.id, response.comm_id);
            return false;
        }

        if self.tx.send(response).is_err() {
            self.mark_dead();
            return false;
        }
        true
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Resolves once the peer's writer has gone away
    pub async fn closed(&self) {
        if !self.alive.load(Ordering::SeqCst) {
            return;
        }
        self.tx.closed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_send_reaches_receiver() {
        let (peer, mut rx) = PeerHandle::new(1);
        assert!(peer.send(Response::new(7, true, "ok")));

        let response = rx.recv().await.unwrap();
        assert_eq!(response.comm_id, 7);
    }

    #[tokio::test]
    async fn test_dead_peer_skips_writes() {
        let (peer, mut rx) = PeerHandle::new(1);
        peer.mark_dead();

        assert!(!peer.send(Response::new(1, true, "ok")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_closed_resolves_when_receiver_dropped() {
        let (peer, rx) = PeerHandle::new(3);
        drop(rx);

        tokio::time::timeout(Duration::from_secs(1), peer.closed())
            .await
            .unwrap();
        assert!(!peer.is_alive());
        assert!(!peer.send(Response::new(1, true, "ok")));
    }
}
