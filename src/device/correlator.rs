//! Correlates device replies with the command that caused them
//!
//! The device protocol carries no request IDs. Replies are matched to
//! commands purely in arrival order, which holds because only one queued
//! request talks to the device at a time.
//!
//! Commands sent without waiting (async sends, exchanges abandoned by an
//! interrupt) still owe a reply. Before the next correlated send, owed
//! replies are waited out and discarded so they are never handed to the
//! wrong command.

use super::DeviceError;
use crate::connection::PeerHandle;
use gateway_shared::defaults;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

/// How long a reply to a fire-and-forget command is expected
const UNANSWERED_REPLY_WINDOW: Duration = Duration::from_millis(500);

/// Conditions that end a wait early: gateway termination or the
/// requesting peer going away
#[derive(Clone)]
pub struct Interrupt {
    terminate: watch::Receiver<bool>,
    origin: Option<PeerHandle>,
}

impl Interrupt {
    pub fn new(terminate: watch::Receiver<bool>, origin: Option<PeerHandle>) -> Self {
        Self { terminate, origin }
    }

    /// Resolves once termination is flagged or the origin is gone
    pub async fn triggered(&self) {
        let mut terminate = self.terminate.clone();
        let terminated = async move {
            while !*terminate.borrow_and_update() {
                if terminate.changed().await.is_err() {
                    break;
                }
            }
        };
        let origin_gone = async {
            match &self.origin {
                Some(origin) => origin.closed().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = terminated => {}
            _ = origin_gone => {}
        }
    }
}

#[derive(Default)]
struct Debt {
    count: usize,
    until: Option<Instant>,
}

/// Replies the device still owes for commands nobody waits on
#[derive(Clone, Default)]
struct OwedReplies(Arc<Mutex<Debt>>);

impl OwedReplies {
    async fn add_until(&self, deadline: Instant) {
        let mut debt = self.0.lock().await;
        debt.count += 1;
        debt.until = Some(debt.until.map_or(deadline, |until| until.max(deadline)));
    }

    async fn settle_one(&self) {
        let mut debt = self.0.lock().await;
        debt.count = debt.count.saturating_sub(1);
        if debt.count == 0 {
            debt.until = None;
        }
    }

    /// Deadline of the outstanding debt, forgiving it once expired
    async fn pending_until(&self) -> Option<Instant> {
        let mut debt = self.0.lock().await;
        match debt.until {
            Some(until) if debt.count > 0 && until > Instant::now() => Some(until),
            _ => {
                *debt = Debt::default();
                None
            }
        }
    }
}

/// Cloneable send side for commands that do not wait for a reply
#[derive(Clone)]
pub struct CommandSender {
    socket: Arc<UdpSocket>,
    device: SocketAddr,
    owed: OwedReplies,
}

impl CommandSender {
    pub fn device(&self) -> SocketAddr {
        self.device
    }

    /// Send `command` and expect its reply to be discarded later
    pub async fn send_unanswered(&self, command: &str) -> Result<(), DeviceError> {
        self.owed
            .add_until(Instant::now() + UNANSWERED_REPLY_WINDOW)
            .await;
        if let Err(e) = send_command(&self.socket, self.device, command).await {
            self.owed.settle_one().await;
            return Err(e);
        }
        Ok(())
    }
}

async fn send_command(socket: &UdpSocket, device: SocketAddr, command: &str) -> Result<(), DeviceError> {
    debug!("[DEVICE] send to {}: {}", device, command);
    socket
        .send_to(command.as_bytes(), device)
        .await
        .map_err(DeviceError::Send)?;
    Ok(())
}

enum Wait {
    Reply(String),
    TimedOut,
    Interrupted,
}

pub struct ResponseCorrelator {
    socket: Arc<UdpSocket>,
    device: SocketAddr,
    inbox: mpsc::UnboundedReceiver<String>,
    owed: OwedReplies,
    reader: JoinHandle<()>,
}

impl ResponseCorrelator {
    /// Start queueing every datagram that arrives on `socket`
    pub fn spawn(socket: Arc<UdpSocket>, device: SocketAddr) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        let reader_socket = socket.clone();

        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1500];
            loop {
                match reader_socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        let text = String::from_utf8_lossy(&buf[..n])
                            .trim_end_matches(&['\r', '\n'][..])
                            .to_string();
                        debug!("[DEVICE] recv from {}: {:?}", from, text);
                        if tx.send(text).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("[DEVICE] Command socket error: {}", e);
                        break;
                    }
                }
            }
        });

        Self {
            socket,
            device,
            inbox,
            owed: OwedReplies::default(),
            reader,
        }
    }

    /// Send side sharing this correlator's owed-reply ledger
    pub fn sender(&self) -> CommandSender {
        CommandSender {
            socket: self.socket.clone(),
            device: self.device,
            owed: self.owed.clone(),
        }
    }

    pub async fn send(&self, command: &str) -> Result<(), DeviceError> {
        send_command(&self.socket, self.device, command).await
    }

    async fn wait_until(&mut self, deadline: Instant, interrupt: &Interrupt) -> Wait {
        tokio::select! {
            biased;
            _ = interrupt.triggered() => Wait::Interrupted,
            reply = timeout_at(deadline, self.inbox.recv()) => match reply {
                Ok(Some(reply)) => Wait::Reply(reply),
                _ => Wait::TimedOut,
            },
        }
    }

    /// Oldest queued reply, or None on timeout or interruption
    pub async fn pop_response(&mut self, wait: Duration, interrupt: &Interrupt) -> Option<String> {
        match self.wait_until(Instant::now() + wait, interrupt).await {
            Wait::Reply(reply) => {
                self.owed.settle_one().await;
                Some(reply)
            }
            Wait::TimedOut | Wait::Interrupted => None,
        }
    }

    /// Drop queued leftovers and wait out replies still owed
    ///
    /// Returns false when interrupted first.
    async fn discard_stale(&mut self, interrupt: &Interrupt) -> bool {
        loop {
            while let Ok(stale) = self.inbox.try_recv() {
                debug!("[DEVICE] Discarding stale reply {:?}", stale);
                self.owed.settle_one().await;
            }

            let Some(deadline) = self.owed.pending_until().await else {
                return true;
            };
            match self.wait_until(deadline, interrupt).await {
                Wait::Reply(stale) => {
                    debug!("[DEVICE] Discarding owed reply {:?}", stale);
                    self.owed.settle_one().await;
                }
                Wait::TimedOut => {}
                Wait::Interrupted => return false,
            }
        }
    }

    /// Reply to the command just sent
    ///
    /// An interrupted wait leaves the reply owed until its deadline.
    async fn await_reply(&mut self, wait: Duration, interrupt: &Interrupt) -> Result<String, DeviceError> {
        let deadline = Instant::now() + wait;
        match self.wait_until(deadline, interrupt).await {
            Wait::Reply(reply) => Ok(reply),
            Wait::TimedOut => Err(DeviceError::ResponseTimeout),
            Wait::Interrupted => {
                self.owed.add_until(deadline).await;
                Err(DeviceError::ResponseTimeout)
            }
        }
    }

    /// Send a command and wait for its reply
    ///
    /// Handshake replies other than the acknowledgement are stale output of
    /// an earlier session: queued leftovers are consumed, otherwise the
    /// handshake is resent, up to `handshake_retries` times.
    pub async fn exchange(
        &mut self,
        command: &str,
        wait: Duration,
        handshake_retries: u32,
        interrupt: &Interrupt,
    ) -> Result<String, DeviceError> {
        if !self.discard_stale(interrupt).await {
            return Err(DeviceError::ResponseTimeout);
        }
        self.send(command).await?;
        let mut reply = self.await_reply(wait, interrupt).await?;

        if command != defaults::HANDSHAKE_COMMAND {
            return Ok(reply);
        }

        let mut attempts = 0;
        while reply.trim() != defaults::HANDSHAKE_ACK {
            if attempts >= handshake_retries {
                return Err(DeviceError::HandshakeRejected(reply));
            }
            attempts += 1;
            debug!(
                "[DEVICE] Stale handshake reply {:?} ({}/{})",
                reply, attempts, handshake_retries
            );

            reply = match self.inbox.try_recv() {
                Ok(next) => next,
                Err(_) => {
                    self.send(command).await?;
                    self.await_reply(wait, interrupt).await?
                }
            };
        }
        Ok(reply)
    }

    /// Stop the reader and wait until the socket is released
    pub async fn close(&mut self) {
        self.reader.abort();
        let _ = (&mut self.reader).await;
    }
}

impl Drop for ResponseCorrelator {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
