//! Bridge between the gateway and a mesh broadcast server
//!
//! The gateway joins the mesh as an ordinary TCP peer. Events from other
//! peers are pushed to every WebSocket peer; `mesh` commands that are not
//! bridge controls go out as broadcasts.

use crate::config::MeshConfig;
use crate::connection::PeerRegistry;
use anyhow::{anyhow, Context, Result};
use gateway_shared::codec::{self, FrameDecoder, MeshEvent, MeshMessageType};
use gateway_shared::Response;
use mesh_server::MeshServer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{lookup_host, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Sender id stamped on events this gateway originates
const BRIDGE_SENDER: u64 = 0;

struct MeshLink {
    remote: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl MeshLink {
    async fn close(mut self) {
        self.reader.abort();
        let _ = self.writer.shutdown().await;
        debug!("[MESH] Bridge to {} closed", self.remote);
    }
}

pub struct MeshBridge {
    config: MeshConfig,
    server: MeshServer,
    peers: Arc<PeerRegistry>,
    link: Mutex<Option<MeshLink>>,
}

impl MeshBridge {
    pub fn new(config: MeshConfig, peers: Arc<PeerRegistry>) -> Self {
        Self {
            config,
            server: MeshServer::new(),
            peers,
            link: Mutex::new(None),
        }
    }

    /// Start the embedded server and join it
    ///
    /// Without `restart` a running server is left alone. Returns the
    /// server's listening address.
    pub async fn start(&self, port: Option<u16>, restart: bool) -> Result<SocketAddr> {
        let addr = SocketAddr::new(self.config.bind, port.unwrap_or(self.config.port));
        let started = self
            .server
            .start(addr, restart)
            .await
            .with_context(|| format!("mesh server bind {}", addr))?;

        let local = self
            .server
            .local_addr()
            .await
            .ok_or_else(|| anyhow!("mesh server is not running"))?;

        if started || self.link.lock().await.is_none() {
            let ip = if local.ip().is_unspecified() {
                IpAddr::V4(Ipv4Addr::LOCALHOST)
            } else {
                local.ip()
            };
            self.attach(SocketAddr::new(ip, local.port())).await?;
        }
        Ok(local)
    }

    /// Join a mesh server at `target` (`host:port`, `host` or `:port`),
    /// falling back to the configured host and port
    pub async fn connect(&self, target: Option<&str>) -> Result<SocketAddr> {
        let (host, port) = match target.map(str::trim).filter(|t| !t.is_empty()) {
            Some(target) => match target.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port
                        .parse::<u16>()
                        .with_context(|| format!("invalid port {:?}", port))?;
                    let host = if host.is_empty() { self.config.host.as_str() } else { host };
                    (host.to_string(), port)
                }
                None => (target.to_string(), self.config.port),
            },
            None => (self.config.host.clone(), self.config.port),
        };

        let remote = lookup_host((host.as_str(), port))
            .await?
            .next()
            .ok_or_else(|| anyhow!("cannot resolve {}", host))?;
        self.attach(remote).await?;
        Ok(remote)
    }

    /// Send raw text to the mesh as a valueless broadcast
    pub async fn broadcast(&self, text: &str) -> Result<()> {
        let frames = codec::compose(&[MeshEvent::broadcast(BRIDGE_SENDER, text)])?;

        let mut link = self.link.lock().await;
        let written = match link.as_mut() {
            Some(active) => write_frames(&mut active.writer, &frames).await,
            None => return Err(anyhow!("mesh not connected")),
        };

        if let Err(e) = written {
            if let Some(dead) = link.take() {
                dead.close().await;
            }
            return Err(anyhow!("mesh write failed: {}", e));
        }
        Ok(())
    }

    /// Leave the mesh and stop the embedded server
    ///
    /// Returns false when neither was running.
    pub async fn terminate(&self) -> bool {
        let link = self.link.lock().await.take();
        let had_link = link.is_some();
        if let Some(link) = link {
            link.close().await;
        }
        let stopped = self.server.stop().await;
        if had_link || stopped {
            info!("[MESH] Bridge terminated");
        }
        had_link || stopped
    }

    pub async fn is_connected(&self) -> bool {
        self.link.lock().await.is_some()
    }

    pub async fn server_addr(&self) -> Option<SocketAddr> {
        self.server.local_addr().await
    }

    pub async fn server_peer_count(&self) -> usize {
        self.server.peer_count().await
    }

    async fn attach(&self, remote: SocketAddr) -> Result<()> {
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(remote))
            .await
            .map_err(|_| anyhow!("mesh connect {}: timeout", remote))?
            .with_context(|| format!("mesh connect {}", remote))?;
        let _ = stream.set_nodelay(true);

        let (reader, writer) = stream.into_split();
        let reader = tokio::spawn(read_mesh(reader, remote, self.peers.clone()));

        let previous = self.link.lock().await.replace(MeshLink {
            remote,
            writer,
            reader,
        });
        if let Some(previous) = previous {
            previous.close().await;
        }

        info!("[MESH] Bridge joined {}", remote);
        Ok(())
    }
}

async fn write_frames(writer: &mut OwnedWriteHalf, frames: &[bytes::Bytes]) -> std::io::Result<()> {
    for frame in frames {
        writer.write_all(frame).await?;
    }
    Ok(())
}

/// Push every event from the mesh to the WebSocket peers
async fn read_mesh(
    mut reader: tokio::net::tcp::OwnedReadHalf,
    remote: SocketAddr,
    peers: Arc<PeerRegistry>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; 4096];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                info!("[MESH] Server {} closed the bridge", remote);
                break;
            }
            Ok(n) => decoder.extend(&buf[..n]),
            Err(e) => {
                warn!("[MESH] Read error from {}: {}", remote, e);
                break;
            }
        }

        loop {
            let text = match decoder.decode_next() {
                Ok(Some(text)) => text,
                Ok(None) => break,
                Err(e) => {
                    warn!("[MESH] Decode error from {}: {}", remote, e);
                    continue;
                }
            };

            let events = match codec::parse_message(&text, BRIDGE_SENDER) {
                Ok(events) => events,
                Err(e) => {
                    warn!("[MESH] Dropping frame from {}: {}", remote, e);
                    continue;
                }
            };

            for event in events {
                if event.message_type == MeshMessageType::PeerName {
                    continue;
                }
                let delivered = peers.broadcast(&Response::mesh(&event)).await;
                debug!("[MESH] {} {:?} pushed to {} peers", event.message_type, event.key, delivered);
            }
        }
    }
}
