//! Individual mesh peer connection handling

use anyhow::{anyhow, Result};
use bytes::Bytes;
use gateway_shared::codec::{self, FrameDecoder, MeshEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Notify, RwLock};
use tracing::{debug, warn};

/// Frames queued for one peer before it counts as stalled
const OUTBOUND_FRAMES: usize = 256;

/// Handle to send frames to a specific peer
#[derive(Clone)]
pub struct PeerHandle {
    pub id: u64,
    pub addr: SocketAddr,
    outbound: mpsc::Sender<Bytes>,
    alive: Arc<AtomicBool>,
    closing: Arc<Notify>,
    protocol_version: Arc<RwLock<Option<String>>>,
    pub connected_at: Instant,
}

impl PeerHandle {
    /// Queue an encoded frame for this peer
    ///
    /// Never waits on the socket. A peer whose queue is full is stalled:
    /// it is marked dead and its write side closed.
    pub fn send(&self, frame: Bytes) -> Result<()> {
        if !self.is_alive() {
            return Err(anyhow!("peer {} is not alive", self.id));
        }

        match self.outbound.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shutdown();
                Err(anyhow!("peer {} stalled with {} frames pending", self.id, OUTBOUND_FRAMES))
            }
            Err(TrySendError::Closed(_)) => {
                self.mark_dead();
                Err(anyhow!("peer {} writer closed", self.id))
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Protocol version announced through `peer-name`, if any
    pub async fn protocol_version(&self) -> Option<String> {
        self.protocol_version.read().await.clone()
    }

    pub async fn set_protocol_version(&self, tag: impl Into<String>) {
        *self.protocol_version.write().await = Some(tag.into());
    }

    /// Stop writing to this peer and close the write side
    pub fn shutdown(&self) {
        self.mark_dead();
        self.closing.notify_one();
    }
}

/// Drain the peer's queue into its socket until closed or told to stop
async fn run_writer(
    id: u64,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    alive: Arc<AtomicBool>,
    closing: Arc<Notify>,
) {
    let pump = async {
        while let Some(frame) = outbound.recv().await {
            if let Err(e) = writer.write_all(&frame).await {
                debug!("[MESH] Write to peer {} failed: {}", id, e);
                alive.store(false, Ordering::SeqCst);
                break;
            }
        }
    };

    tokio::select! {
        _ = pump => {}
        _ = closing.notified() => {}
    }
    let _ = writer.shutdown().await;
}

/// Active peer session
pub struct MeshSession {
    pub handle: PeerHandle,
    reader: OwnedReadHalf,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
}

impl MeshSession {
    /// Create a new session from an accepted TCP stream
    pub fn new(stream: TcpStream, addr: SocketAddr, id: u64) -> Self {
        let (reader, writer) = stream.into_split();
        let (outbound, queued) = mpsc::channel(OUTBOUND_FRAMES);
        let alive = Arc::new(AtomicBool::new(true));
        let closing = Arc::new(Notify::new());

        tokio::spawn(run_writer(id, writer, queued, alive.clone(), closing.clone()));

        let handle = PeerHandle {
            id,
            addr,
            outbound,
            alive,
            closing,
            protocol_version: Arc::new(RwLock::new(None)),
            connected_at: Instant::now(),
        };

        Self {
            handle,
            reader,
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; 4096],
        }
    }

    /// Get a cloneable handle for sending frames
    pub fn get_handle(&self) -> PeerHandle {
        self.handle.clone()
    }

    /// Read the events of the next well-formed frame
    /// Returns None if the connection is closed
    pub async fn recv(&mut self) -> Option<Vec<MeshEvent>> {
        loop {
            // First try to decode from existing buffer
            match self.decoder.decode_next() {
                Ok(Some(text)) => match codec::parse_message(&text, self.handle.id) {
                    Ok(events) => return Some(events),
                    Err(e) => {
                        warn!("[MESH] Dropping frame from peer {}: {}", self.handle.id, e);
                        continue;
                    }
                },
                Ok(None) => {
                    // Need more data
                }
                Err(e) => {
                    warn!("[MESH] Decode error from peer {}: {}", self.handle.id, e);
                    continue;
                }
            }

            // Read more data
            match self.reader.read(&mut self.read_buf).await {
                Ok(0) => return None,
                Ok(n) => {
                    self.decoder.extend(&self.read_buf[..n]);
                }
                Err(e) => {
                    warn!("[MESH] Read error from {}: {}", self.handle.addr, e);
                    return None;
                }
            }
        }
    }
}
