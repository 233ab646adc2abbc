//! Device telemetry cache
//!
//! The device pushes `key:value;key:value;...` datagrams to the telemetry
//! port several times a second. Only the latest value per key is kept.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tracing::{debug, trace, warn};

/// Latest telemetry values, keyed as the device names them
pub struct TelemetryCache {
    values: RwLock<HashMap<String, i64>>,
    /// Time of the last update, for staleness reporting
    updated_at: RwLock<Option<Instant>>,
}

impl TelemetryCache {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            updated_at: RwLock::new(None),
        }
    }

    /// Apply one telemetry line, returning the number of fields stored
    pub async fn update(&self, line: &str) -> usize {
        let fields = parse_state_line(line);
        if fields.is_empty() {
            return 0;
        }

        let count = fields.len();
        let mut values = self.values.write().await;
        values.extend(fields);
        drop(values);

        *self.updated_at.write().await = Some(Instant::now());
        count
    }

    pub async fn get(&self, key: &str) -> Option<i64> {
        self.values.read().await.get(key).copied()
    }

    pub async fn snapshot(&self) -> HashMap<String, i64> {
        self.values.read().await.clone()
    }

    /// Milliseconds since the last update, if any arrived
    pub async fn age_ms(&self) -> Option<u64> {
        self.updated_at
            .read()
            .await
            .map(|t| t.elapsed().as_millis() as u64)
    }

    pub async fn clear(&self) {
        self.values.write().await.clear();
        *self.updated_at.write().await = None;
    }
}

impl Default for TelemetryCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a `key:value;...` line into integer fields
///
/// Fractional values are truncated toward zero; non-numeric fields are
/// skipped.
pub fn parse_state_line(line: &str) -> Vec<(String, i64)> {
    line.trim()
        .split(';')
        .filter_map(|field| {
            let (key, value) = field.split_once(':')?;
            let key = key.trim();
            let value = value.trim();
            if key.is_empty() {
                return None;
            }

            let parsed = value.parse::<i64>().ok().or_else(|| {
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .map(|v| v.trunc() as i64)
            });
            match parsed {
                Some(v) => Some((key.to_string(), v)),
                None => {
                    trace!("[DEVICE] Skipping non-numeric telemetry {}={}", key, value);
                    None
                }
            }
        })
        .collect()
}

/// Feed telemetry datagrams into the cache until the task is aborted
pub(crate) async fn run_reader(socket: UdpSocket, cache: Arc<TelemetryCache>) {
    let mut buf = [0u8; 1500];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => {
                let line = String::from_utf8_lossy(&buf[..n]);
                let count = cache.update(&line).await;
                trace!("[DEVICE] {} telemetry fields from {}", count, from);
            }
            Err(e) => {
                warn!("[DEVICE] Telemetry socket error: {}", e);
                debug!("[DEVICE] Telemetry reader stopped");
                break;
            }
        }
    }
}
