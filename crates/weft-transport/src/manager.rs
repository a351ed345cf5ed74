use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use weft_codec::{Codec, FrameDecoder, WireFormat};
use weft_core::envelope::mesh_kind;
use weft_core::{Envelope, MESH_NAMESPACE, Result, WeftError, now_ms};
use weft_overlay::{DialData, OverlayHandle, SidecarCommand, SidecarEvent};

use crate::connection::{
    ConnectionDirection, ConnectionInfo, ConnectionRow, ConnectionStatus,
    REASON_HEARTBEAT_TIMEOUT, REASON_SEND_BUFFER_FULL, REASON_SERVICE_STOPPED, incoming_id,
    outgoing_id, reconnect_delay,
};

/// Timings and codec for the connection pool.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub heartbeat_ping: Duration,
    pub heartbeat_timeout: Duration,
    pub dial_timeout: Duration,
    pub max_reconnect_delay: Duration,
    pub default_port: u16,
    pub codec: Codec,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_ping: Duration::from_secs(2),
            heartbeat_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(10),
            max_reconnect_delay: Duration::from_secs(30),
            default_port: 443,
            codec: Codec::new(WireFormat::Binary),
        }
    }
}

/// What the transport reports upward to the mesh node.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Connected {
        connection_id: String,
        device_id: Option<String>,
        direction: ConnectionDirection,
    },
    Disconnected {
        connection_id: String,
        device_id: Option<String>,
        reason: String,
    },
    /// A decoded application or control envelope (heartbeats are already
    /// intercepted and never appear here).
    Frame {
        connection_id: String,
        device_id: Option<String>,
        envelope: Envelope,
    },
}

struct ReconnectEntry {
    hostname: String,
    dns_name: Option<String>,
    port: u16,
    attempts: u32,
}

type DialWaiter = oneshot::Sender<std::result::Result<String, String>>;

struct Inner {
    running: bool,
    connections: HashMap<String, ConnectionRow>,
    by_device: HashMap<String, String>,
    pending_dials: HashMap<String, Vec<DialWaiter>>,
    reconnects: HashMap<String, ReconnectEntry>,
    reconnect_timers: HashMap<String, JoinHandle<()>>,
}

/// Owns every stream above the overlay: accepted (`incoming:<id>`) and
/// dialed (`dial:<deviceId>`) rows, their heartbeats, and the reconnect
/// ledger. All state is behind one mutex; events are emitted after release.
pub struct ConnectionManager {
    overlay: OverlayHandle,
    config: TransportConfig,
    inner: Mutex<Inner>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl ConnectionManager {
    pub fn new(
        overlay: OverlayHandle,
        config: TransportConfig,
    ) -> (Arc<Self>, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let manager = Arc::new(Self {
            overlay,
            config,
            inner: Mutex::new(Inner {
                running: false,
                connections: HashMap::new(),
                by_device: HashMap::new(),
                pending_dials: HashMap::new(),
                reconnects: HashMap::new(),
                reconnect_timers: HashMap::new(),
            }),
            events_tx,
        });
        (manager, events_rx)
    }

    pub fn start(&self) {
        self.inner.lock().running = true;
    }

    pub fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    /// Tear everything down. Close events carry `service_stopped`, which
    /// never schedules a reconnect.
    pub fn stop(&self) {
        let closed: Vec<(String, Option<String>)> = {
            let mut inner = self.inner.lock();
            inner.running = false;
            for (_, timer) in inner.reconnect_timers.drain() {
                timer.abort();
            }
            inner.reconnects.clear();
            inner.pending_dials.clear();
            inner.by_device.clear();
            inner
                .connections
                .drain()
                .map(|(id, mut row)| {
                    if let Some(hb) = row.heartbeat.take() {
                        hb.abort();
                    }
                    (id, row.info.device_id)
                })
                .collect()
        };
        for (connection_id, device_id) in closed {
            self.emit(TransportEvent::Disconnected {
                connection_id,
                device_id,
                reason: REASON_SERVICE_STOPPED.into(),
            });
        }
        info!("transport stopped");
    }

    // ── Outgoing ───────────────────────────────────────────────

    /// Open (or reuse) the outgoing stream to a device. Idempotent: an
    /// existing connected row is returned as-is and no new dial is issued.
    /// Registers the device in the reconnect ledger, so later disconnects
    /// re-dial with backoff until `remove_reconnect` or `stop`.
    pub async fn connect(
        self: &Arc<Self>,
        device_id: &str,
        hostname: &str,
        dns_name: Option<String>,
        port: Option<u16>,
    ) -> Result<String> {
        let port = port.unwrap_or(self.config.default_port);
        let conn_id = outgoing_id(device_id);

        let (rx, first) = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return Err(WeftError::NotConnected("transport not running".into()));
            }
            if let Some(row) = inner.connections.get(&conn_id) {
                if row.info.status == ConnectionStatus::Connected {
                    return Ok(conn_id);
                }
            }

            inner
                .reconnects
                .entry(device_id.to_string())
                .and_modify(|e| {
                    e.hostname = hostname.to_string();
                    e.dns_name = dns_name.clone();
                    e.port = port;
                })
                .or_insert(ReconnectEntry {
                    hostname: hostname.to_string(),
                    dns_name: dns_name.clone(),
                    port,
                    attempts: 0,
                });

            let (tx, rx) = oneshot::channel();
            let waiters = inner.pending_dials.entry(device_id.to_string()).or_default();
            let first = waiters.is_empty();
            waiters.push(tx);

            inner.connections.entry(conn_id.clone()).or_insert_with(|| ConnectionRow {
                info: ConnectionInfo {
                    id: conn_id.clone(),
                    device_id: Some(device_id.to_string()),
                    direction: ConnectionDirection::Outgoing,
                    remote_addr: hostname.to_string(),
                    status: ConnectionStatus::Connecting,
                    connected_at: None,
                    last_activity_at: now_ms(),
                    metadata: HashMap::new(),
                },
                sidecar_id: None,
                decoder: FrameDecoder::new(self.config.codec.clone()),
                last_activity: Instant::now(),
                heartbeat: None,
            });
            inner
                .by_device
                .entry(device_id.to_string())
                .or_insert_with(|| conn_id.clone());
            (rx, first)
        };

        if first {
            self.overlay
                .send(SidecarCommand::Dial(DialData {
                    device_id: device_id.to_string(),
                    hostname: hostname.to_string(),
                    dns_name,
                    port,
                }))
                .await?;
        }

        match tokio::time::timeout(self.config.dial_timeout, rx).await {
            Ok(Ok(Ok(conn_id))) => Ok(conn_id),
            Ok(Ok(Err(reason))) => Err(WeftError::DialError {
                device_id: device_id.to_string(),
                reason,
            }),
            // Resolver dropped: the transport was stopped underneath us.
            Ok(Err(_)) => Err(WeftError::DialError {
                device_id: device_id.to_string(),
                reason: "transport stopped".into(),
            }),
            Err(_) => {
                let mut inner = self.inner.lock();
                inner.pending_dials.remove(device_id);
                if inner
                    .connections
                    .get(&conn_id)
                    .is_some_and(|row| row.info.status == ConnectionStatus::Connecting)
                {
                    inner.connections.remove(&conn_id);
                    if inner.by_device.get(device_id) == Some(&conn_id) {
                        inner.by_device.remove(device_id);
                    }
                }
                self.schedule_reconnect(&mut inner, device_id);
                drop(inner);
                Err(WeftError::DialTimeout(device_id.to_string()))
            }
        }
    }

    /// Drop the reconnect ledger entry for a device and cancel any pending
    /// backoff timer. Aside from stopping the transport, this is the only
    /// way to end the reconnect loop.
    pub fn remove_reconnect(&self, device_id: &str) {
        let mut inner = self.inner.lock();
        inner.reconnects.remove(device_id);
        if let Some(timer) = inner.reconnect_timers.remove(device_id) {
            timer.abort();
        }
    }

    // ── Overlay event intake ───────────────────────────────────

    /// Feed one connection-scoped sidecar event into the pool. The mesh node
    /// routes `ws*` / `dial*` events here and keeps the rest.
    pub fn handle_overlay_event(self: &Arc<Self>, event: SidecarEvent) {
        match event {
            SidecarEvent::WsConnect {
                connection_id,
                remote_addr,
            } => self.accept_incoming(&connection_id, &remote_addr),
            SidecarEvent::WsMessage {
                connection_id,
                data,
            } => self.handle_frame_data(&incoming_id(&connection_id), &data),
            SidecarEvent::WsDisconnect {
                connection_id,
                reason,
            } => {
                self.close_connection(
                    &incoming_id(&connection_id),
                    reason.as_deref().unwrap_or("disconnected"),
                );
            }
            SidecarEvent::DialConnected {
                device_id,
                remote_addr,
            } => self.dial_connected(&device_id, &remote_addr),
            SidecarEvent::DialMessage { device_id, data } => {
                self.handle_frame_data(&outgoing_id(&device_id), &data)
            }
            SidecarEvent::DialDisconnect { device_id, reason } => {
                self.close_connection(
                    &outgoing_id(&device_id),
                    reason.as_deref().unwrap_or("disconnected"),
                );
            }
            SidecarEvent::DialError { device_id, error } => self.dial_error(&device_id, &error),
            other => {
                debug!(?other, "non-connection sidecar event ignored by transport");
            }
        }
    }

    fn accept_incoming(self: &Arc<Self>, sidecar_id: &str, remote_addr: &str) {
        let conn_id = incoming_id(sidecar_id);
        {
            let mut inner = self.inner.lock();
            if !inner.running {
                return;
            }
            inner.connections.insert(
                conn_id.clone(),
                ConnectionRow {
                    info: ConnectionInfo {
                        id: conn_id.clone(),
                        device_id: None,
                        direction: ConnectionDirection::Incoming,
                        remote_addr: remote_addr.to_string(),
                        status: ConnectionStatus::Connected,
                        connected_at: Some(now_ms()),
                        last_activity_at: now_ms(),
                        metadata: HashMap::new(),
                    },
                    sidecar_id: Some(sidecar_id.to_string()),
                    decoder: FrameDecoder::new(self.config.codec.clone()),
                    last_activity: Instant::now(),
                    heartbeat: None,
                },
            );
        }
        self.attach_heartbeat(&conn_id);
        info!(connection = %conn_id, remote = remote_addr, "incoming connection accepted");
        self.emit(TransportEvent::Connected {
            connection_id: conn_id,
            device_id: None,
            direction: ConnectionDirection::Incoming,
        });
    }

    fn dial_connected(self: &Arc<Self>, device_id: &str, remote_addr: &str) {
        let conn_id = outgoing_id(device_id);
        let waiters = {
            let mut inner = self.inner.lock();
            if !inner.running {
                return;
            }
            let row = inner
                .connections
                .entry(conn_id.clone())
                .or_insert_with(|| ConnectionRow {
                    info: ConnectionInfo {
                        id: conn_id.clone(),
                        device_id: Some(device_id.to_string()),
                        direction: ConnectionDirection::Outgoing,
                        remote_addr: remote_addr.to_string(),
                        status: ConnectionStatus::Connecting,
                        connected_at: None,
                        last_activity_at: now_ms(),
                        metadata: HashMap::new(),
                    },
                    sidecar_id: None,
                    decoder: FrameDecoder::new(self.config.codec.clone()),
                    last_activity: Instant::now(),
                    heartbeat: None,
                });
            row.info.status = ConnectionStatus::Connected;
            row.info.remote_addr = remote_addr.to_string();
            row.info.connected_at = Some(now_ms());
            row.last_activity = Instant::now();
            inner
                .by_device
                .entry(device_id.to_string())
                .or_insert_with(|| conn_id.clone());
            if let Some(entry) = inner.reconnects.get_mut(device_id) {
                entry.attempts = 0;
            }
            inner.pending_dials.remove(device_id).unwrap_or_default()
        };
        for waiter in waiters {
            let _ = waiter.send(Ok(conn_id.clone()));
        }
        self.attach_heartbeat(&conn_id);
        info!(connection = %conn_id, remote = remote_addr, "outgoing connection established");
        self.emit(TransportEvent::Connected {
            connection_id: conn_id,
            device_id: Some(device_id.to_string()),
            direction: ConnectionDirection::Outgoing,
        });
    }

    fn dial_error(self: &Arc<Self>, device_id: &str, error: &str) {
        warn!(device = device_id, error, "dial failed");
        let conn_id = outgoing_id(device_id);
        let waiters = {
            let mut inner = self.inner.lock();
            if inner
                .connections
                .get(&conn_id)
                .is_some_and(|row| row.info.status == ConnectionStatus::Connecting)
            {
                inner.connections.remove(&conn_id);
                if inner.by_device.get(device_id) == Some(&conn_id) {
                    inner.by_device.remove(device_id);
                }
            }
            let waiters = inner.pending_dials.remove(device_id).unwrap_or_default();
            self.schedule_reconnect(&mut inner, device_id);
            waiters
        };
        for waiter in waiters {
            let _ = waiter.send(Err(error.to_string()));
        }
    }

    // ── Frames ─────────────────────────────────────────────────

    fn handle_frame_data(self: &Arc<Self>, conn_id: &str, data: &str) {
        let bytes = match BASE64.decode(data) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(connection = conn_id, error = %e, "undecodable frame data");
                self.close_connection(conn_id, "invalid frame encoding");
                return;
            }
        };

        let mut frames = Vec::new();
        let mut decode_err = None;
        let device_id = {
            let mut inner = self.inner.lock();
            let Some(row) = inner.connections.get_mut(conn_id) else {
                return;
            };
            row.last_activity = Instant::now();
            row.info.last_activity_at = now_ms();
            row.decoder.extend(&bytes);
            loop {
                match row.decoder.next_frame() {
                    Ok(Some(envelope)) => frames.push(envelope),
                    Ok(None) => break,
                    Err(e) => {
                        decode_err = Some(e);
                        break;
                    }
                }
            }
            row.info.device_id.clone()
        };

        for envelope in frames {
            if envelope.namespace == MESH_NAMESPACE {
                match envelope.kind.as_str() {
                    mesh_kind::PING => {
                        let echo = envelope
                            .payload
                            .get("timestamp")
                            .cloned()
                            .unwrap_or(serde_json::Value::Null);
                        let pong = Envelope::new(
                            MESH_NAMESPACE,
                            mesh_kind::PONG,
                            serde_json::json!({ "timestamp": echo }),
                        );
                        self.send_to_connection(conn_id, &pong);
                        continue;
                    }
                    mesh_kind::PONG => continue,
                    _ => {}
                }
            }
            self.emit(TransportEvent::Frame {
                connection_id: conn_id.to_string(),
                device_id: device_id.clone(),
                envelope,
            });
        }

        if let Some(e) = decode_err {
            warn!(connection = conn_id, error = %e, "frame decode failed, closing connection");
            self.close_connection(conn_id, &e.to_string());
        }
    }

    /// Encode and send one envelope on a specific connection. Returns
    /// `false` when the row is unknown or not connected. A full outbound
    /// buffer tears the connection down (reconnect will rebuild it).
    pub fn send_to_connection(self: &Arc<Self>, connection_id: &str, envelope: &Envelope) -> bool {
        let command = {
            let inner = self.inner.lock();
            let Some(row) = inner.connections.get(connection_id) else {
                return false;
            };
            if row.info.status != ConnectionStatus::Connected {
                return false;
            }
            let bytes = match self.config.codec.encode(envelope) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(connection = connection_id, error = %e, "failed to encode frame");
                    return false;
                }
            };
            let data = BASE64.encode(bytes);
            match row.info.direction {
                ConnectionDirection::Outgoing => SidecarCommand::DialMessage {
                    device_id: row
                        .info
                        .device_id
                        .clone()
                        .unwrap_or_default(),
                    data,
                },
                ConnectionDirection::Incoming => SidecarCommand::WsMessage {
                    connection_id: row.sidecar_id.clone().unwrap_or_default(),
                    data,
                },
            }
        };

        match self.overlay.try_send(command) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = connection_id, error = %e, "outbound send failed, closing");
                self.close_connection(connection_id, REASON_SEND_BUFFER_FULL);
                false
            }
        }
    }

    // ── Identity binding ───────────────────────────────────────

    /// Bind a device id to a connection after the remote identifies itself.
    /// The binding is immutable once set; the device↔connection index keeps
    /// its first entry so exactly one stream carries directed traffic.
    pub fn set_connection_device_id(&self, connection_id: &str, device_id: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(row) = inner.connections.get_mut(connection_id) else {
            return false;
        };
        match &row.info.device_id {
            Some(existing) => existing == device_id,
            None => {
                row.info.device_id = Some(device_id.to_string());
                inner
                    .by_device
                    .entry(device_id.to_string())
                    .or_insert_with(|| connection_id.to_string());
                debug!(connection = connection_id, device = device_id, "connection bound");
                true
            }
        }
    }

    // ── Lookups ────────────────────────────────────────────────

    pub fn connection_for_device(&self, device_id: &str) -> Option<String> {
        let inner = self.inner.lock();
        let conn_id = inner.by_device.get(device_id)?;
        inner
            .connections
            .get(conn_id)
            .filter(|row| row.info.status == ConnectionStatus::Connected)
            .map(|row| row.info.id.clone())
    }

    /// All connected rows with a bound device id, for broadcast fan-out.
    pub fn bound_connections(&self) -> Vec<(String, String)> {
        let inner = self.inner.lock();
        inner
            .by_device
            .iter()
            .filter(|(_, conn_id)| {
                inner
                    .connections
                    .get(*conn_id)
                    .is_some_and(|row| row.info.status == ConnectionStatus::Connected)
            })
            .map(|(device_id, conn_id)| (conn_id.clone(), device_id.clone()))
            .collect()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.inner
            .lock()
            .connections
            .values()
            .map(|row| row.snapshot())
            .collect()
    }

    // ── Close / reconnect ──────────────────────────────────────

    fn close_connection(self: &Arc<Self>, conn_id: &str, reason: &str) {
        let removed = {
            let mut inner = self.inner.lock();
            let Some(mut row) = inner.connections.remove(conn_id) else {
                return;
            };
            if let Some(hb) = row.heartbeat.take() {
                hb.abort();
            }
            if let Some(device_id) = &row.info.device_id {
                if inner.by_device.get(device_id).map(String::as_str) == Some(conn_id) {
                    inner.by_device.remove(device_id);
                }
            }
            let reconnect = row.info.direction == ConnectionDirection::Outgoing
                && reason != REASON_SERVICE_STOPPED
                && inner.running;
            if reconnect {
                if let Some(device_id) = row.info.device_id.clone() {
                    let _ = self
                        .overlay
                        .try_send(SidecarCommand::DialClose {
                            device_id: device_id.clone(),
                        });
                    self.schedule_reconnect(&mut inner, &device_id);
                }
            }
            row
        };
        info!(connection = conn_id, reason, "connection closed");
        self.emit(TransportEvent::Disconnected {
            connection_id: conn_id.to_string(),
            device_id: removed.info.device_id,
            reason: reason.to_string(),
        });
    }

    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner, device_id: &str) {
        if !inner.running {
            return;
        }
        let Some(entry) = inner.reconnects.get_mut(device_id) else {
            return;
        };
        entry.attempts += 1;
        let delay = reconnect_delay(entry.attempts, self.config.max_reconnect_delay);
        debug!(
            device = device_id,
            attempt = entry.attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );
        if let Some(old) = inner.reconnect_timers.remove(device_id) {
            old.abort();
        }
        let manager = Arc::clone(self);
        let device = device_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let target = {
                let mut inner = manager.inner.lock();
                inner.reconnect_timers.remove(&device);
                if !inner.running {
                    return;
                }
                inner
                    .reconnects
                    .get(&device)
                    .map(|e| (e.hostname.clone(), e.dns_name.clone(), e.port))
            };
            let Some((hostname, dns_name, port)) = target else {
                return;
            };
            if let Err(e) = manager
                .connect(&device, &hostname, dns_name, Some(port))
                .await
            {
                debug!(device = %device, error = %e, "reconnect attempt failed");
            }
        });
        inner.reconnect_timers.insert(device_id.to_string(), timer);
    }

    // ── Heartbeat ──────────────────────────────────────────────

    fn attach_heartbeat(self: &Arc<Self>, conn_id: &str) {
        let manager = Arc::clone(self);
        let id = conn_id.to_string();
        let ping_every = self.config.heartbeat_ping;
        let idle_limit = self.config.heartbeat_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let idle = {
                    let inner = manager.inner.lock();
                    match inner.connections.get(&id) {
                        Some(row) => row.last_activity.elapsed(),
                        None => return,
                    }
                };
                if idle > idle_limit {
                    manager.close_connection(&id, REASON_HEARTBEAT_TIMEOUT);
                    return;
                }
                let ping = Envelope::new(
                    MESH_NAMESPACE,
                    mesh_kind::PING,
                    serde_json::json!({ "timestamp": now_ms() }),
                );
                if !manager.send_to_connection(&id, &ping) {
                    return;
                }
            }
        });
        let mut inner = self.inner.lock();
        match inner.connections.get_mut(conn_id) {
            Some(row) => {
                if let Some(old) = row.heartbeat.replace(handle) {
                    old.abort();
                }
            }
            // Row vanished between insert and here; don't leak the task.
            None => handle.abort(),
        }
    }

    fn emit(&self, event: TransportEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!("transport event buffer full, dropping event");
        }
    }
}
