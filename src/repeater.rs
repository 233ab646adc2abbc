//! The command repeater
//!
//! Wires the WebSocket listener, the peer registry, the device session, the
//! mesh bridge and the sequencer together, and tears them down in order.

use crate::command::{self, CommandExecutor, HandlerContext, SequencerHandle};
use crate::config::GatewayConfig;
use crate::connection::{self, AppState, PeerRegistry};
use crate::device::{DeviceRegistry, DeviceSession, SessionSettings};
use crate::transport::{MeshBridge, WifiAdapter};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Grace period for the HTTP server to wind down after sessions close
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Repeater {
    local_addr: SocketAddr,
    peers: Arc<PeerRegistry>,
    device: Arc<DeviceSession>,
    mesh: Arc<MeshBridge>,
    sequencer: SequencerHandle,
    sequencer_task: JoinHandle<()>,
    stop_listener: oneshot::Sender<()>,
    server: JoinHandle<std::io::Result<()>>,
    shutdown: Arc<Notify>,
}

impl Repeater {
    /// Bind the WebSocket listener and start serving
    pub async fn start(config: &GatewayConfig, wifi: Arc<dyn WifiAdapter>) -> Result<Self> {
        let device = Arc::new(DeviceSession::new(
            DeviceRegistry::new(config.devices.clone()),
            wifi,
            SessionSettings::from_config(config),
        ));
        let peers = Arc::new(PeerRegistry::new());
        let mesh = Arc::new(MeshBridge::new(config.mesh.clone(), peers.clone()));

        if config.mesh.auto_start {
            match mesh.start(None, false).await {
                Ok(addr) => info!("[MESH] Embedded server on {}", addr),
                Err(e) => warn!("[MESH] Embedded server not started: {:#}", e),
            }
        }

        let (terminate, terminate_rx) = watch::channel(false);
        let shutdown = Arc::new(Notify::new());
        let ctx = HandlerContext::new(
            device.clone(),
            mesh.clone(),
            peers.clone(),
            terminate_rx,
            shutdown.clone(),
        );
        let (sequencer, sequencer_task) =
            command::spawn_sequencer(CommandExecutor::new(ctx), terminate);

        let bind = SocketAddr::new(config.gateway.bind, config.gateway.port);
        let listener = TcpListener::bind(bind)
            .await
            .with_context(|| format!("Failed to bind WebSocket listener on {}", bind))?;
        let local_addr = listener.local_addr()?;

        let app = connection::router(Arc::new(AppState {
            peers: peers.clone(),
            sequencer: sequencer.clone(),
            device: device.clone(),
            mesh: mesh.clone(),
        }));

        let (stop_listener, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = stopped.await;
                })
                .await
        });

        info!("[WS] Listening on ws://{}/", local_addr);

        Ok(Self {
            local_addr,
            peers,
            device,
            mesh,
            sequencer,
            sequencer_task,
            stop_listener,
            server,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolves when a peer sends `module:sync:terminate`
    pub async fn shutdown_requested(&self) {
        self.shutdown.notified().await;
    }

    /// Stop everything, answering every accepted request first
    pub async fn close(self) -> Result<()> {
        info!("[WS] Repeater closing");

        self.sequencer.stop().await;
        if let Err(e) = self.sequencer_task.await {
            warn!("[CMD] Sequencer task ended abnormally: {}", e);
        }

        self.device.disconnect().await;
        self.mesh.terminate().await;
        self.peers.close_all().await;

        let _ = self.stop_listener.send(());
        let mut server = self.server;
        match tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut server).await {
            Ok(Ok(result)) => result.context("WebSocket server failed")?,
            Ok(Err(e)) => warn!("[WS] Server task ended abnormally: {}", e),
            Err(_) => {
                warn!("[WS] Server did not drain in time, aborting");
                server.abort();
            }
        }

        info!("[WS] Repeater closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::FakeDevice;
    use crate::device::DeviceRecord;
    use crate::transport::StaticWifi;
    use futures::{SinkExt, StreamExt};
    use gateway_shared::codec::{self, FrameDecoder, MeshEvent, MeshMessageType};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::time::timeout;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    fn test_config(device: &FakeDevice) -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.gateway.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.gateway.port = 0;
        config.gateway.request_timeout_ms = 2000;
        config.gateway.device_bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.mesh.bind = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.mesh.port = 0;
        config.devices =
            vec![DeviceRecord::new("test", device.addr.ip()).with_ports(device.addr.port(), 0)];
        config
    }

    async fn start() -> (Repeater, FakeDevice) {
        let device = FakeDevice::spawn(|cmd| match cmd {
            "battery?" => vec!["87".to_string()],
            _ => vec!["ok".to_string()],
        })
        .await;
        let repeater = Repeater::start(&test_config(&device), Arc::new(StaticWifi::new()))
            .await
            .unwrap();
        (repeater, device)
    }

    async fn client(repeater: &Repeater) -> Client {
        let url = format!("ws://{}/", repeater.local_addr());
        let (ws, _) = connect_async(url).await.unwrap();
        ws
    }

    async fn next_json(ws: &mut Client) -> serde_json::Value {
        loop {
            let msg = timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("frame in time")
                .expect("stream open")
                .unwrap();
            if let Message::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_websocket_round_trip() {
        let (repeater, device) = start().await;
        let mut ws = client(&repeater).await;

        ws.send(Message::Text("1:module:sync:connect".into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["commID"], 1);
        assert_eq!(reply["result"], true);
        assert_eq!(reply["message"], "ok");

        ws.send(Message::Text("7:tello:sync:battery?".into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["commID"], 7);
        assert_eq!(reply["result"], true);
        assert_eq!(reply["message"], "87");
        assert_eq!(device.received().await, vec!["battery?"]);

        repeater.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_frame_is_ignored() {
        let (repeater, _device) = start().await;
        let mut ws = client(&repeater).await;

        ws.send(Message::Text("not a control frame".into())).await.unwrap();
        ws.send(Message::Text("2:nowhere:sync:x".into())).await.unwrap();
        ws.send(Message::Text("3:module:sync:isAlive".into())).await.unwrap();

        let reply = next_json(&mut ws).await;
        assert_eq!(reply["commID"], 3);
        assert_eq!(reply["message"], "disconnected");

        repeater.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (repeater, _device) = start().await;

        let mut stream = TcpStream::connect(repeater.local_addr()).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).await.unwrap();

        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains(r#""status":"ok""#));
        assert!(body.contains(r#""link":"disconnected""#));

        repeater.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_mesh_events_reach_websocket_peers() {
        let (repeater, _device) = start().await;
        let mut ws = client(&repeater).await;

        ws.send(Message::Text("1:mesh:sync:start".into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["result"], true, "{}", reply);
        let mesh_addr = repeater.mesh.server_addr().await.unwrap();

        let mut sensor = TcpStream::connect(mesh_addr).await.unwrap();
        // Wait until the server sees both the bridge and the sensor peer
        for _ in 0..50 {
            if repeater.mesh.server_peer_count().await == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let frames = codec::compose(&[MeshEvent::new(
            9,
            MeshMessageType::SensorUpdate,
            "temp",
            Some("21".into()),
        )])
        .unwrap();
        for frame in frames {
            sensor.write_all(&frame).await.unwrap();
        }

        let notice = next_json(&mut ws).await;
        assert_eq!(notice["commID"], -1);
        assert_eq!(notice["message"], "sensor-update");
        assert_eq!(notice["key"], "temp");
        assert_eq!(notice["value"], "21");

        // And a mesh command from the front end reaches the sensor peer
        ws.send(Message::Text("2:mesh:sync:hello".into())).await.unwrap();
        let reply = next_json(&mut ws).await;
        assert_eq!(reply["commID"], 2);
        assert_eq!(reply["message"], "ok");

        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 1024];
        let event = loop {
            if let Some(text) = decoder.decode_next().unwrap() {
                break codec::parse_message(&text, 0).unwrap().remove(0);
            }
            let n = timeout(Duration::from_secs(5), sensor.read(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert!(n > 0, "mesh closed");
            decoder.extend(&buf[..n]);
        };
        assert_eq!(event.message_type, MeshMessageType::Broadcast);
        assert_eq!(event.key, "hello");

        repeater.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_rejects_queued_and_closes_peers() {
        let device = FakeDevice::spawn(|_| vec![]).await;
        let repeater = Repeater::start(&test_config(&device), Arc::new(StaticWifi::new()))
            .await
            .unwrap();
        let mut ws = client(&repeater).await;

        ws.send(Message::Text("1:module:sync:connect".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["message"], "ok");

        ws.send(Message::Text("2:tello:sync:takeoff".into())).await.unwrap();
        ws.send(Message::Text("3:tello:sync:land".into())).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        timeout(Duration::from_secs(5), repeater.close())
            .await
            .expect("close in time")
            .unwrap();

        let in_flight = next_json(&mut ws).await;
        assert_eq!(in_flight["commID"], 2);
        assert_eq!(in_flight["result"], false);

        let queued = next_json(&mut ws).await;
        assert_eq!(queued["commID"], 3);
        assert_eq!(queued["message"], "command rejected");

        // The session hangs up after flushing
        let closed = timeout(Duration::from_secs(5), async {
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    return true;
                }
            }
            true
        })
        .await
        .unwrap();
        assert!(closed);
    }

    #[tokio::test]
    async fn test_terminate_command_signals_shutdown() {
        let (repeater, _device) = start().await;
        let mut ws = client(&repeater).await;

        ws.send(Message::Text("5:module:sync:terminate".into())).await.unwrap();
        assert_eq!(next_json(&mut ws).await["message"], "OK");

        timeout(Duration::from_secs(1), repeater.shutdown_requested())
            .await
            .expect("terminate notifies the repeater");
        repeater.close().await.unwrap();
    }
}
