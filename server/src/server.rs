//! Remote Sensors Protocol broadcast server
//!
//! Accepts TCP peers and relays every well-formed message from one peer
//! to all others. `peer-name` messages only tag the sending peer.

use crate::session::{MeshSession, PeerManager};
use gateway_shared::codec::{self, MeshMessageType};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Running {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    peers: Arc<PeerManager>,
}

impl Running {
    async fn shutdown(self) {
        self.accept_task.abort();
        self.peers.close_all().await;
        info!("[MESH] Server on {} stopped", self.local_addr);
    }
}

/// Broadcast server handle; at most one listener runs at a time
#[derive(Default)]
pub struct MeshServer {
    running: Mutex<Option<Running>>,
}

impl MeshServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening on `addr`
    ///
    /// Returns `Ok(false)` when a listener is already running and `restart`
    /// is not set. With `restart`, the running listener and all its peers
    /// are dropped first.
    pub async fn start(&self, addr: SocketAddr, restart: bool) -> io::Result<bool> {
        let mut running = self.running.lock().await;

        if running.is_some() {
            if !restart {
                debug!("[MESH] Server already running");
                return Ok(false);
            }
            if let Some(previous) = running.take() {
                previous.shutdown().await;
            }
        }

        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let peers = Arc::new(PeerManager::new());
        let accept_task = tokio::spawn(accept_loop(listener, peers.clone()));

        info!("[MESH] Listening on {}", local_addr);

        *running = Some(Running {
            local_addr,
            accept_task,
            peers,
        });
        Ok(true)
    }

    pub async fn restart(&self, addr: SocketAddr) -> io::Result<bool> {
        self.start(addr, true).await
    }

    /// Stop the listener and disconnect every peer
    ///
    /// Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        let previous = self.running.lock().await.take();
        match previous {
            Some(running) => {
                running.shutdown().await;
                true
            }
            None => false,
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    pub async fn peer_count(&self) -> usize {
        let peers = self.running.lock().await.as_ref().map(|r| r.peers.clone());
        match peers {
            Some(peers) => peers.count().await,
            None => 0,
        }
    }
}

async fn accept_loop(listener: TcpListener, peers: Arc<PeerManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let _ = stream.set_nodelay(true);
                let id = peers.next_id();
                let session = MeshSession::new(stream, addr, id);
                peers.register(session.get_handle()).await;

                let task = tokio::spawn(run_session(session, peers.clone()));
                peers.attach_task(id, task).await;
            }
            Err(e) => {
                warn!("[MESH] Accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn run_session(mut session: MeshSession, peers: Arc<PeerManager>) {
    let id = session.handle.id;
    info!("[MESH] Peer {} connected from {}", id, session.handle.addr);

    while let Some(events) = session.recv().await {
        let mut relayed = Vec::with_capacity(events.len());
        for event in events {
            if event.message_type == MeshMessageType::PeerName {
                debug!("[MESH] Peer {} announced {}", id, event.key);
                session.handle.set_protocol_version(event.key).await;
            } else {
                relayed.push(event);
            }
        }

        if relayed.is_empty() {
            continue;
        }

        match codec::compose(&relayed) {
            Ok(frames) => {
                let delivered = peers.relay(id, &frames).await;
                debug!("[MESH] Relayed {} events from peer {} to {} peers", relayed.len(), id, delivered);
            }
            Err(e) => warn!("[MESH] Could not re-encode frame from peer {}: {}", id, e),
        }
    }

    session.handle.shutdown();
    peers.unregister(id).await;
    let tag = session.handle.protocol_version().await;
    info!(
        "[MESH] Peer {} ({}) disconnected after {:?}",
        id,
        tag.as_deref().unwrap_or("unnamed"),
        session.handle.connected_at.elapsed()
    );
}
