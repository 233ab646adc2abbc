//! The active device session
//!
//! At most one device holds live sockets. Bringing a device up walks the
//! link state machine: scan and associate with its access point (when the
//! record names one), then bind the command and telemetry sockets.

use super::correlator::{CommandSender, Interrupt, ResponseCorrelator};
use super::registry::{DeviceRecord, DeviceRegistry};
use super::telemetry::{self, TelemetryCache};
use super::DeviceError;
use crate::config::GatewayConfig;
use crate::transport::{WifiAdapter, WifiEvent};
use gateway_shared::{LinkEvent, LinkState, LinkStateMachine, TransitionResult};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const READY_MESSAGE: &str = "ok";

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub request_timeout: Duration,
    pub bind_timeout: Duration,
    pub handshake_retries: u32,
    /// Local address both device sockets bind to
    pub bind_ip: IpAddr,
    pub local_command_port: u16,
    /// Access point passwords by SSID
    pub passwords: HashMap<String, String>,
}

impl SessionSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            request_timeout: config.gateway.request_timeout(),
            bind_timeout: config.gateway.bind_timeout(),
            handshake_retries: config.gateway.handshake_retries,
            bind_ip: config.gateway.device_bind,
            local_command_port: config.gateway.local_command_port,
            passwords: config.wifi.passwords.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&GatewayConfig::default())
    }
}

#[derive(Default)]
struct Link {
    fsm: LinkStateMachine,
    active: Option<DeviceRecord>,
    /// SSID the adapter is associated with on our behalf
    associated: Option<String>,
    sender: Option<CommandSender>,
    telemetry_addr: Option<SocketAddr>,
    telemetry_task: Option<JoinHandle<()>>,
    wifi_watch: Option<JoinHandle<()>>,
}

pub struct DeviceSession {
    registry: RwLock<DeviceRegistry>,
    wifi: Arc<dyn WifiAdapter>,
    settings: SessionSettings,
    link: Arc<Mutex<Link>>,
    /// Exclusive while a correlated exchange is in flight
    correlator: Mutex<Option<ResponseCorrelator>>,
    telemetry: Arc<TelemetryCache>,
}

impl DeviceSession {
    pub fn new(
        registry: DeviceRegistry,
        wifi: Arc<dyn WifiAdapter>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            registry: RwLock::new(registry),
            wifi,
            settings,
            link: Arc::new(Mutex::new(Link::default())),
            correlator: Mutex::new(None),
            telemetry: Arc::new(TelemetryCache::new()),
        }
    }

    /// Bring a device link up
    ///
    /// Without a name the active device is reused, else the first
    /// registered one. Naming a different device releases the current link.
    pub async fn connect(&self, name: Option<&str>) -> Result<String, DeviceError> {
        let mut link = self.link.lock().await;
        let record = self.resolve(name, &link).await?;

        if let Some(active) = &link.active {
            if active.name != record.name {
                info!("[DEVICE] Switching from {} to {}", active.name, record.name);
                self.release(&mut link).await;
            }
        }
        link.active = Some(record.clone());

        if link.fsm.is_ready() {
            debug!("[DEVICE] {} already ready", record.name);
            return Ok(READY_MESSAGE.to_string());
        }

        match self.bring_up(&mut link, record).await {
            Ok(record) => {
                link.active = Some(record);
                Ok(READY_MESSAGE.to_string())
            }
            Err(e) => {
                let result = link.fsm.process_event(LinkEvent::Failed {
                    reason: e.to_string(),
                });
                if let TransitionResult::Dropped { from, reason } = result {
                    warn!("[DEVICE] Link dropped while {}: {}", from, reason);
                }
                Err(e)
            }
        }
    }

    /// Release sockets and the WiFi association
    ///
    /// Returns false when nothing was up.
    pub async fn disconnect(&self) -> bool {
        let mut link = self.link.lock().await;
        let released = self.release(&mut link).await;
        if released {
            info!("[DEVICE] Link released");
        }
        released
    }

    pub async fn state(&self) -> LinkState {
        self.link.lock().await.fsm.state()
    }

    pub async fn active_device(&self) -> Option<String> {
        self.link.lock().await.active.as_ref().map(|r| r.name.clone())
    }

    pub async fn telemetry(&self, key: &str) -> Option<i64> {
        self.telemetry.get(key).await
    }

    /// Default wait for a correlated reply
    pub fn request_timeout(&self) -> Duration {
        self.settings.request_timeout
    }

    pub async fn telemetry_addr(&self) -> Option<SocketAddr> {
        self.link.lock().await.telemetry_addr
    }

    /// Fire a command at the device without waiting for a reply
    pub async fn send_async(&self, command: &str) -> Result<(), DeviceError> {
        let sender = self.link.lock().await.sender.clone();
        let sender = sender.ok_or(DeviceError::NotConnected)?;
        debug!("[DEVICE] send async to {}: {}", sender.device(), command);
        sender.send_unanswered(command).await
    }

    /// Send a command and await its correlated reply
    pub async fn exchange(&self, command: &str, interrupt: &Interrupt) -> Result<String, DeviceError> {
        let mut correlator = self.correlator.lock().await;
        let correlator = correlator.as_mut().ok_or(DeviceError::NotConnected)?;
        correlator
            .exchange(
                command,
                self.settings.request_timeout,
                self.settings.handshake_retries,
                interrupt,
            )
            .await
    }

    /// Oldest unclaimed reply from the device
    pub async fn pop_response(&self, wait: Duration, interrupt: &Interrupt) -> Option<String> {
        let mut correlator = self.correlator.lock().await;
        match correlator.as_mut() {
            Some(correlator) => correlator.pop_response(wait, interrupt).await,
            None => None,
        }
    }

    /// Register a device, replacing one with the same name
    pub async fn add_device(&self, record: DeviceRecord) -> bool {
        let name = record.name.clone();
        let mut registry = self.registry.write().await;
        let replaced = registry.add(record);
        info!(
            "[DEVICE] {} {} ({} registered)",
            if replaced { "Replaced" } else { "Added" },
            name,
            registry.count()
        );
        replaced
    }

    /// Every cached telemetry value and its age
    pub async fn telemetry_snapshot(&self) -> (HashMap<String, i64>, Option<u64>) {
        (self.telemetry.snapshot().await, self.telemetry.age_ms().await)
    }

    pub async fn device_names(&self) -> Vec<String> {
        self.registry.read().await.names()
    }

    async fn resolve(&self, name: Option<&str>, link: &Link) -> Result<DeviceRecord, DeviceError> {
        let registry = self.registry.read().await;
        match (name, &link.active) {
            (Some(name), _) => registry
                .find(name)
                .cloned()
                .ok_or_else(|| DeviceError::UnknownDevice(name.to_string())),
            (None, Some(active)) => Ok(registry
                .find(&active.name)
                .cloned()
                .unwrap_or_else(|| active.clone())),
            (None, None) => registry.first().cloned().ok_or(DeviceError::NoDevices),
        }
    }

    async fn bring_up(&self, link: &mut Link, mut record: DeviceRecord) -> Result<DeviceRecord, DeviceError> {
        if let Some(ssid) = record.ssid.clone() {
            if link.associated.as_deref() != Some(ssid.as_str()) {
                if let Some(ip) = self.associate(link, &record, &ssid).await? {
                    record.ip = ip;
                    self.registry.write().await.update_ip(&record.name, ip);
                }
            }
        }

        self.bind(link, &record).await?;
        Ok(record)
    }

    async fn associate(
        &self,
        link: &mut Link,
        record: &DeviceRecord,
        ssid: &str,
    ) -> Result<Option<IpAddr>, DeviceError> {
        link.fsm.process_event(LinkEvent::ScanStarted);

        let count = self.wifi.init().await.map_err(wifi_error)?;
        if count == 0 {
            return Err(DeviceError::WifiDown);
        }
        info!("[DEVICE] WiFi found {} APs", count);

        let mut network = self.wifi.lookup(ssid).await.map_err(wifi_error)?;
        if network.is_none() {
            if let Some(mac) = &record.mac {
                network = self.wifi.lookup(mac).await.map_err(wifi_error)?;
            }
        }
        let network = network.ok_or_else(|| DeviceError::AccessPointNotFound(ssid.to_string()))?;
        link.fsm.process_event(LinkEvent::AccessPointResolved);

        info!("[DEVICE] Try WiFi direct connect: {}", ssid);
        let events = self.wifi.subscribe();
        let password = record
            .password
            .clone()
            .or_else(|| self.settings.passwords.get(ssid).cloned());
        let association = self
            .wifi
            .connect(&network, password.as_deref())
            .await
            .map_err(wifi_error)?;

        if !association.success {
            return Err(DeviceError::Association {
                ssid: ssid.to_string(),
                reason: association.message,
            });
        }
        debug!("[DEVICE] {}", association.message);

        link.associated = Some(ssid.to_string());
        if let Some(watch) = link.wifi_watch.take() {
            watch.abort();
        }
        link.wifi_watch = Some(tokio::spawn(watch_association(
            events,
            ssid.to_string(),
            self.link.clone(),
        )));

        let ip = match association.ip {
            Some(ip) => Some(ip),
            None => self.wifi.connection_state().await.ip,
        };
        if let Some(ip) = ip {
            info!("[DEVICE] IP: {}", ip);
        }
        Ok(ip)
    }

    async fn bind(&self, link: &mut Link, record: &DeviceRecord) -> Result<(), DeviceError> {
        self.release_sockets(link).await;
        link.fsm.process_event(LinkEvent::BindStarted);

        let bind_timeout = self.settings.bind_timeout;
        let command = bind_udp(
            SocketAddr::new(self.settings.bind_ip, self.settings.local_command_port),
            bind_timeout,
        )
        .await?;
        let telemetry = bind_udp(
            SocketAddr::new(self.settings.bind_ip, record.telemetry_port),
            bind_timeout,
        )
        .await?;
        let telemetry_addr = telemetry.local_addr().map_err(|source| DeviceError::Bind {
            port: record.telemetry_port,
            source,
        })?;

        let device = SocketAddr::new(record.ip, record.command_port);
        let correlator = ResponseCorrelator::spawn(Arc::new(command), device);
        link.sender = Some(correlator.sender());
        *self.correlator.lock().await = Some(correlator);

        link.telemetry_addr = Some(telemetry_addr);
        link.telemetry_task = Some(tokio::spawn(telemetry::run_reader(
            telemetry,
            self.telemetry.clone(),
        )));
        link.fsm.process_event(LinkEvent::SocketsBound);

        info!(
            "[DEVICE] {} ready at {} (telemetry on {})",
            record.name, device, telemetry_addr
        );
        Ok(())
    }

    async fn release_sockets(&self, link: &mut Link) {
        link.sender = None;
        link.telemetry_addr = None;

        if let Some(task) = link.telemetry_task.take() {
            task.abort();
            let _ = task.await;
        }

        let correlator = self.correlator.lock().await.take();
        if let Some(mut correlator) = correlator {
            correlator.close().await;
        }
        self.telemetry.clear().await;
    }

    async fn release(&self, link: &mut Link) -> bool {
        let mut released = link.sender.is_some();
        self.release_sockets(link).await;

        if let Some(watch) = link.wifi_watch.take() {
            watch.abort();
        }
        if let Some(ssid) = link.associated.take() {
            released = true;
            if let Err(e) = self.wifi.disconnect().await {
                warn!("[DEVICE] WiFi disconnect from {} failed: {}", ssid, e);
            }
        }

        link.fsm.process_event(LinkEvent::Released);
        released
    }
}

fn wifi_error(e: anyhow::Error) -> DeviceError {
    DeviceError::Wifi(e.to_string())
}

async fn bind_udp(addr: SocketAddr, limit: Duration) -> Result<UdpSocket, DeviceError> {
    timeout(limit, UdpSocket::bind(addr))
        .await
        .map_err(|_| DeviceError::BindTimeout(addr.port()))?
        .map_err(|source| DeviceError::Bind {
            port: addr.port(),
            source,
        })
}

/// Drop the link state when the adapter reports the association gone
async fn watch_association(
    mut events: broadcast::Receiver<WifiEvent>,
    ssid: String,
    link: Arc<Mutex<Link>>,
) {
    loop {
        match events.recv().await {
            Ok(WifiEvent::Disconnected { ssid: lost }) if lost == ssid => {
                warn!("[DEVICE] WiFi association to {} lost", ssid);
                let mut link = link.lock().await;
                link.associated = None;
                link.fsm.process_event(LinkEvent::Failed {
                    reason: format!("association to {} lost", ssid),
                });
                break;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("[DEVICE] WiFi watcher skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
pub(crate) fn test_settings() -> SessionSettings {
    SessionSettings {
        request_timeout: Duration::from_secs(2),
        bind_timeout: Duration::from_secs(2),
        handshake_retries: 2,
        bind_ip: IpAddr::from([127, 0, 0, 1]),
        local_command_port: 0,
        passwords: HashMap::new(),
    }
}
