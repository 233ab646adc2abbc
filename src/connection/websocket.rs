//! WebSocket listener for front-end peers
//!
//! Each text frame is one control envelope. Responses are queued on the
//! peer's channel and written by a forward task, so handlers never touch the
//! socket directly.

use super::manager::PeerRegistry;
use super::peer::PeerHandle;
use crate::command::{Request, SequencerHandle};
use crate::device::DeviceSession;
use crate::transport::MeshBridge;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use gateway_shared::{ControlEnvelope, Response};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared state behind every route
pub struct AppState {
    pub peers: Arc<PeerRegistry>,
    pub sequencer: SequencerHandle,
    pub device: Arc<DeviceSession>,
    pub mesh: Arc<MeshBridge>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    if state.peers.is_shutting_down() {
        debug!("[WS] Refusing peer during shutdown");
        return;
    }

    let (handle, rx) = state.peers.register().await;
    let session = PeerSession {
        handle,
        sequencer: state.sequencer.clone(),
    };
    session.run(socket, rx, state.peers.clone()).await;
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let (telemetry, telemetry_age_ms) = state.device.telemetry_snapshot().await;

    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "peers": state.peers.live_count().await,
        "devices": state.device.device_names().await,
        "device": state.device.active_device().await,
        "link": state.device.state().await.to_string(),
        "telemetry": telemetry,
        "telemetry_age_ms": telemetry_age_ms,
        "mesh": state.mesh.is_connected().await,
        "mesh_server": state.mesh.server_addr().await.map(|addr| addr.to_string()),
    }))
}

/// One connected front end
struct PeerSession {
    handle: PeerHandle,
    sequencer: SequencerHandle,
}

impl PeerSession {
    async fn run(
        self,
        socket: WebSocket,
        mut rx: mpsc::UnboundedReceiver<Response>,
        peers: Arc<PeerRegistry>,
    ) {
        let id = self.handle.id;
        info!("[WS] Peer {} connected ({} live)", id, peers.live_count().await);

        let (mut ws_tx, mut ws_rx) = socket.split();
        let mut shutdown = peers.subscribe_shutdown();

        let mut forward = tokio::spawn(async move {
            loop {
                tokio::select! {
                    response = rx.recv() => match response {
                        Some(response) => {
                            if write_response(&mut ws_tx, &response).await.is_err() {
                                debug!("[WS] Peer {} send failed, closing", id);
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = async { let _ = shutdown.wait_for(|closing| *closing).await; } => {
                        // Flush what handlers already queued, then hang up
                        while let Ok(response) = rx.try_recv() {
                            if write_response(&mut ws_tx, &response).await.is_err() {
                                break;
                            }
                        }
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let mut forward_done = false;
        loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(msg) => {
                        if !self.handle_message(msg) {
                            break;
                        }
                    }
                    None => break,
                },
                _ = &mut forward => {
                    forward_done = true;
                    break;
                }
            }
        }

        // Queued requests from this peer still run; their responses are skipped
        peers.unregister(id).await;
        if !forward_done {
            forward.abort();
        }
        info!("[WS] Peer {} disconnected", id);
    }

    /// Returns false once the peer is done
    fn handle_message(&self, msg: Result<Message, axum::Error>) -> bool {
        let id = self.handle.id;
        match msg {
            Ok(Message::Text(text)) => self.handle_frame(&text),
            Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                Ok(text) => self.handle_frame(text),
                Err(_) => warn!("[WS] Peer {} sent a non UTF-8 binary frame", id),
            },
            Ok(Message::Close(_)) => {
                debug!("[WS] Peer {} closed connection", id);
                return false;
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Err(e) => {
                debug!("[WS] Peer {} error: {}", id, e);
                return false;
            }
        }
        true
    }

    fn handle_frame(&self, text: &str) {
        let envelope = match ControlEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("[WS] Peer {} sent malformed frame {:?}: {}", self.handle.id, text, e);
                return;
            }
        };

        let request = Request::new(self.sequencer.next_msg_id(), envelope, self.handle.clone());
        if let Err(mut refused) = self.sequencer.submit(request) {
            refused.reject();
            refused.respond();
        }
    }
}

async fn write_response(
    ws_tx: &mut SplitSink<WebSocket, Message>,
    response: &Response,
) -> Result<(), axum::Error> {
    match response.to_json() {
        Ok(json) => ws_tx.send(Message::Text(json)).await,
        Err(e) => {
            error!("[WS] Failed to serialize response: {}", e);
            Ok(())
        }
    }
}
