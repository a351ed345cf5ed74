use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use weft_core::envelope::mesh_kind;
use weft_core::{
    Device, DeviceRole, Envelope, EventBus, MESH_NAMESPACE, MeshEvent, MeshMessage, MeshPayload,
    RouteBroadcast, RouteMessage, now_ms,
};
use weft_overlay::{OverlayHandle, SidecarCommand, SidecarEvent, SidecarState, StatusData};
use weft_transport::{ConnectionManager, TransportConfig, TransportEvent};

use crate::bus::{EnvelopeSender, IncomingMessage};
use crate::election::{ElectionConfig, ElectionCoordinator, ElectionEffect};
use crate::table::{DeviceTable, TableEvent};

/// Identity and cadence for one mesh node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Stable device id, persisted by the application.
    pub device_id: String,
    /// Single `-`-free label (e.g. `desktop`).
    pub device_type: String,
    /// Mutable human label.
    pub device_name: String,
    /// Application-wide hostname prefix.
    pub prefix: String,
    /// Designate this device as the preferred primary.
    pub prefer_primary: bool,
    pub capabilities: Vec<String>,
    pub announce_interval: Duration,
    /// Delay before the first peer-discovery pass after startup.
    pub warmup: Duration,
    pub election: ElectionConfig,
    pub transport: TransportConfig,
}

impl NodeConfig {
    pub fn new(
        device_id: impl Into<String>,
        device_type: impl Into<String>,
        device_name: impl Into<String>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.into(),
            device_type: device_type.into(),
            device_name: device_name.into(),
            prefix: prefix.into(),
            prefer_primary: false,
            capabilities: Vec::new(),
            announce_interval: Duration::from_secs(30),
            warmup: Duration::from_secs(1),
            election: ElectionConfig::default(),
            transport: TransportConfig::default(),
        }
    }

    pub fn local_device(&self) -> Device {
        let mut device = Device::new(
            self.device_id.clone(),
            self.device_type.clone(),
            self.device_name.clone(),
            &self.prefix,
        );
        device.capabilities = self.capabilities.clone();
        device.os = Some(std::env::consts::OS.to_string());
        device
    }
}

/// The mesh node: composes the overlay, transport, device table, election
/// coordinator, and routing into a logical star over the physical mesh.
///
/// One pump task serializes every event source; component state stays behind
/// each component's own lock and events are handled strictly in arrival
/// order.
pub struct MeshNode {
    config: NodeConfig,
    overlay: OverlayHandle,
    table: Arc<DeviceTable>,
    transport: Arc<ConnectionManager>,
    election: Arc<ElectionCoordinator>,
    events: EventBus,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    running: AtomicBool,
    pending: Mutex<Option<PendingReceivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

struct PendingReceivers {
    transport_rx: mpsc::Receiver<TransportEvent>,
    table_rx: mpsc::Receiver<TableEvent>,
    election_rx: mpsc::Receiver<ElectionEffect>,
}

impl MeshNode {
    pub fn new(config: NodeConfig, overlay: OverlayHandle, events: EventBus) -> Arc<Self> {
        let (table, table_rx) = DeviceTable::new(config.local_device(), config.prefix.clone());
        let (transport, transport_rx) =
            ConnectionManager::new(overlay.clone(), config.transport.clone());
        let (election, election_rx) = ElectionCoordinator::new(
            config.device_id.clone(),
            config.prefer_primary,
            config.election.clone(),
        );
        let (incoming_tx, _) = broadcast::channel(1024);

        Arc::new(Self {
            config,
            overlay,
            table,
            transport,
            election,
            events,
            incoming_tx,
            running: AtomicBool::new(false),
            pending: Mutex::new(Some(PendingReceivers {
                transport_rx,
                table_rx,
                election_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn table(&self) -> &Arc<DeviceTable> {
        &self.table
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Stream of incoming application messages, consumed by the message bus.
    pub fn incoming(&self) -> broadcast::Receiver<IncomingMessage> {
        self.incoming_tx.subscribe()
    }

    /// Bring the node up. `overlay_rx` is the running sidecar's event stream
    /// and `status` its last report (source of the local ip / dns name).
    pub fn start(self: &Arc<Self>, overlay_rx: mpsc::Receiver<SidecarEvent>, status: StatusData) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("mesh node already running");
            return;
        }
        let Some(receivers) = self.pending.lock().take() else {
            warn!("mesh node receivers already consumed, cannot start");
            return;
        };

        info!(device = %self.config.device_id, "mesh node starting");
        self.table.set_local_started_at(now_ms());
        self.election.mark_started();
        self.transport.start();
        self.table.set_local_online(status.ip, status.dns_name);

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_pump(overlay_rx, receivers));
        tasks.push(self.spawn_announce_ticker());
        tasks.push(self.spawn_warmup());
    }

    /// Wind the node down: announce ticker stops, peers get a goodbye, the
    /// transport closes every stream, and table/election state is reset.
    /// Every timer the node owns dies here.
    pub fn stop(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("mesh node stopping");
        self.control_broadcast(MeshPayload::DeviceGoodbye {
            device_id: self.config.device_id.clone(),
        });
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.transport.stop();
        self.table.set_local_offline();
        self.table.reset();
        self.election.reset();
    }

    // ── Background tasks ───────────────────────────────────────

    fn spawn_pump(
        self: &Arc<Self>,
        mut overlay_rx: mpsc::Receiver<SidecarEvent>,
        receivers: PendingReceivers,
    ) -> JoinHandle<()> {
        let node = Arc::clone(self);
        let PendingReceivers {
            mut transport_rx,
            mut table_rx,
            mut election_rx,
        } = receivers;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = overlay_rx.recv() => node.on_overlay_event(event),
                    Some(event) = transport_rx.recv() => node.on_transport_event(event),
                    Some(event) = table_rx.recv() => node.on_table_event(event),
                    Some(effect) = election_rx.recv() => node.on_election_effect(effect),
                    else => break,
                }
            }
            debug!("mesh node pump ended");
        })
    }

    fn spawn_announce_ticker(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(node.config.announce_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                node.broadcast_announce();
                // Re-list peers every cycle so the table heals missed events.
                let _ = node.overlay.send(SidecarCommand::GetPeers).await;
                // A primary re-seeds its device list with the announce; this
                // closes the window for devices that missed the first one.
                if node.table.is_local_primary() {
                    node.broadcast_device_list();
                }
            }
        })
    }

    fn spawn_warmup(self: &Arc<Self>) -> JoinHandle<()> {
        let node = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(node.config.warmup).await;
            let _ = node.overlay.send(SidecarCommand::GetPeers).await;
            if node.table.primary_id().is_none() {
                node.election.handle_no_primary_on_startup();
            }
        })
    }

    // ── Overlay events ─────────────────────────────────────────

    fn on_overlay_event(self: &Arc<Self>, event: SidecarEvent) {
        match event {
            SidecarEvent::Status(status) => {
                if status.state == Some(SidecarState::Running) {
                    self.table.set_local_online(status.ip, status.dns_name);
                }
            }
            SidecarEvent::AuthRequired { auth_url } => {
                self.events.publish(MeshEvent::AuthRequired { auth_url });
            }
            SidecarEvent::Peers { peers } => {
                self.table.handle_peer_list(&peers);
            }
            SidecarEvent::Error { code, message } => {
                warn!(code = ?code, message = %message, "sidecar error");
            }
            connection_event => self.transport.handle_overlay_event(connection_event),
        }
    }

    // ── Transport events ───────────────────────────────────────

    fn on_transport_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Connected {
                connection_id,
                device_id,
                ..
            } => {
                self.events.publish(MeshEvent::ConnectionUp {
                    connection_id: connection_id.clone(),
                    device_id,
                });
                // Identify ourselves on every fresh stream; a primary also
                // seeds the newcomer with the device list.
                self.send_control_on(&connection_id, self.announce_payload());
                if self.table.is_local_primary() {
                    self.send_control_on(&connection_id, self.device_list_payload());
                }
            }
            TransportEvent::Disconnected {
                connection_id,
                device_id,
                reason,
            } => {
                self.events.publish(MeshEvent::ConnectionDown {
                    connection_id,
                    reason,
                });
                if let Some(device_id) = device_id {
                    // Only mark the device offline when no other stream
                    // still reaches it.
                    if self.transport.connection_for_device(&device_id).is_none() {
                        self.table.mark_device_offline(&device_id);
                    }
                }
            }
            TransportEvent::Frame {
                connection_id,
                device_id,
                envelope,
            } => self.on_frame(&connection_id, device_id, envelope),
        }
    }

    fn on_frame(self: &Arc<Self>, connection_id: &str, device_id: Option<String>, envelope: Envelope) {
        if envelope.namespace != MESH_NAMESPACE {
            self.surface_incoming(envelope, device_id, Some(connection_id.to_string()));
            return;
        }
        match envelope.kind.as_str() {
            mesh_kind::MESSAGE => self.on_control_message(connection_id, &envelope),
            mesh_kind::ROUTE_MESSAGE => self.on_route_message(connection_id, device_id, &envelope),
            mesh_kind::ROUTE_BROADCAST => {
                self.on_route_broadcast(connection_id, device_id, &envelope)
            }
            other => {
                warn!(kind = other, "unknown mesh envelope type dropped");
            }
        }
    }

    fn on_control_message(self: &Arc<Self>, connection_id: &str, envelope: &Envelope) {
        let message = match MeshMessage::from_envelope(envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(connection = connection_id, error = %e, "invalid control payload dropped");
                return;
            }
        };
        debug!(connection = connection_id, from = %message.from, "control message");

        if let MeshPayload::DeviceAnnounce { device } = &message.payload {
            // First announce on a stream binds it to the sender.
            self.transport
                .set_connection_device_id(connection_id, &device.id);
        }

        match message.payload {
            MeshPayload::DeviceAnnounce { device } | MeshPayload::DeviceUpdate { device } => {
                self.table.handle_device_announce(&message.from, device);
            }
            MeshPayload::DeviceGoodbye { device_id } => {
                self.transport.remove_reconnect(&device_id);
                self.table.mark_device_offline(&device_id);
            }
            MeshPayload::DeviceList {
                devices,
                primary_id,
            } => {
                self.election.set_primary(primary_id.clone());
                self.table
                    .handle_device_list(&message.from, devices, primary_id);
            }
            MeshPayload::ElectionStart {} => self.election.handle_election_start(&message.from),
            MeshPayload::ElectionCandidate { candidate } => {
                self.election.handle_candidate(candidate);
            }
            MeshPayload::ElectionVote { candidate_id } => {
                debug!(candidate = %candidate_id, "legacy election vote ignored");
            }
            MeshPayload::ElectionResult { primary_id, .. } => {
                self.election.handle_result(&primary_id);
            }
            MeshPayload::Error { code, message } => {
                warn!(code = %code, message = %message, "error message from peer");
            }
        }
    }

    fn on_route_message(
        self: &Arc<Self>,
        connection_id: &str,
        origin_device: Option<String>,
        envelope: &Envelope,
    ) {
        if !self.table.is_local_primary() {
            warn!(connection = connection_id, "route:message while not primary, dropped");
            return;
        }
        let route: RouteMessage = match serde_json::from_value(envelope.payload.clone()) {
            Ok(route) => route,
            Err(e) => {
                warn!(error = %e, "invalid route:message payload dropped");
                return;
            }
        };
        if route.target_device_id == self.config.device_id {
            self.surface_incoming(route.envelope, origin_device, Some(connection_id.to_string()));
            return;
        }
        match self.transport.connection_for_device(&route.target_device_id) {
            Some(target_connection) => {
                self.transport
                    .send_to_connection(&target_connection, &route.envelope);
            }
            None => {
                debug!(target = %route.target_device_id, "no connection for routed message");
            }
        }
    }

    fn on_route_broadcast(
        self: &Arc<Self>,
        connection_id: &str,
        origin_device: Option<String>,
        envelope: &Envelope,
    ) {
        if !self.table.is_local_primary() {
            warn!(connection = connection_id, "route:broadcast while not primary, dropped");
            return;
        }
        let route: RouteBroadcast = match serde_json::from_value(envelope.payload.clone()) {
            Ok(route) => route,
            Err(e) => {
                warn!(error = %e, "invalid route:broadcast payload dropped");
                return;
            }
        };
        // Fan out to everyone except the origin, then surface locally.
        for (target_connection, _device) in self.transport.bound_connections() {
            if target_connection == connection_id {
                continue;
            }
            self.transport
                .send_to_connection(&target_connection, &route.envelope);
        }
        self.surface_incoming(route.envelope, origin_device, Some(connection_id.to_string()));
    }

    // ── Table events ───────────────────────────────────────────

    fn on_table_event(self: &Arc<Self>, event: TableEvent) {
        match event {
            TableEvent::DeviceDiscovered(device) => {
                self.events.publish(MeshEvent::DeviceDiscovered {
                    device: device.clone(),
                });
                // Converge to full connectivity without waiting for the
                // remote side to dial us.
                let node = Arc::clone(self);
                let task = tokio::spawn(async move {
                    if let Err(e) = node
                        .transport
                        .connect(&device.id, &device.hostname, device.dns_name.clone(), None)
                        .await
                    {
                        debug!(device = %device.id, error = %e, "dial to discovered device failed");
                    }
                });
                self.tasks.lock().push(task);
            }
            TableEvent::DeviceUpdated(device) => {
                self.events.publish(MeshEvent::DeviceUpdated { device });
            }
            TableEvent::DeviceOffline { device_id } => {
                self.events.publish(MeshEvent::DeviceOffline { device_id });
            }
            TableEvent::DevicesChanged(devices) => {
                self.events.publish(MeshEvent::DevicesChanged { devices });
            }
            TableEvent::PrimaryChanged(primary_id) => {
                self.events.publish(MeshEvent::PrimaryChanged {
                    primary_id: primary_id.clone(),
                });
                match primary_id {
                    Some(primary_id) => self.election.set_primary(Some(primary_id)),
                    None => {
                        if self.is_running() {
                            self.election.handle_primary_lost("");
                        }
                    }
                }
            }
            TableEvent::LocalDeviceChanged(device) => {
                self.events
                    .publish(MeshEvent::LocalDeviceChanged { device });
                if self.is_running() {
                    self.broadcast_announce();
                }
            }
        }
    }

    // ── Election effects ───────────────────────────────────────

    fn on_election_effect(self: &Arc<Self>, effect: ElectionEffect) {
        match effect {
            ElectionEffect::BroadcastStart => {
                self.control_broadcast(MeshPayload::ElectionStart {});
            }
            ElectionEffect::BroadcastCandidate(candidate) => {
                self.control_broadcast(MeshPayload::ElectionCandidate { candidate });
            }
            ElectionEffect::BroadcastResult { primary_id, reason } => {
                self.control_broadcast(MeshPayload::ElectionResult { primary_id, reason });
            }
            ElectionEffect::Decided {
                primary_id,
                is_local,
            } => {
                info!(primary = %primary_id, is_local, "primary decided");
                self.table.set_primary(Some(primary_id));
                self.events.publish(MeshEvent::RoleChanged {
                    role: Some(if is_local {
                        DeviceRole::Primary
                    } else {
                        DeviceRole::Secondary
                    }),
                });
                if is_local {
                    self.broadcast_device_list();
                }
            }
        }
    }

    // ── Application send/broadcast ─────────────────────────────

    fn surface_incoming(
        &self,
        envelope: Envelope,
        from: Option<String>,
        connection_id: Option<String>,
    ) {
        let _ = self.incoming_tx.send(IncomingMessage {
            from,
            connection_id,
            namespace: envelope.namespace,
            kind: envelope.kind,
            payload: envelope.payload,
            timestamp: envelope.timestamp,
        });
    }

    fn announce_payload(&self) -> MeshPayload {
        MeshPayload::DeviceAnnounce {
            device: self.table.local_device(),
        }
    }

    fn device_list_payload(&self) -> MeshPayload {
        MeshPayload::DeviceList {
            devices: self.table.all_devices(),
            primary_id: self.table.primary_id(),
        }
    }

    fn broadcast_announce(self: &Arc<Self>) {
        self.control_broadcast(self.announce_payload());
    }

    fn broadcast_device_list(self: &Arc<Self>) {
        self.control_broadcast(self.device_list_payload());
    }

    /// Send a control message on every bound connection.
    fn control_broadcast(self: &Arc<Self>, payload: MeshPayload) {
        let envelope = match MeshMessage::new(self.config.device_id.clone(), payload).into_envelope()
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "failed to build control envelope");
                return;
            }
        };
        for (connection_id, _device) in self.transport.bound_connections() {
            self.transport.send_to_connection(&connection_id, &envelope);
        }
    }

    /// Send a control message on one connection.
    fn send_control_on(self: &Arc<Self>, connection_id: &str, payload: MeshPayload) {
        match MeshMessage::new(self.config.device_id.clone(), payload).into_envelope() {
            Ok(envelope) => {
                self.transport.send_to_connection(connection_id, &envelope);
            }
            Err(e) => warn!(error = %e, "failed to build control envelope"),
        }
    }
}

impl EnvelopeSender for MeshNode {
    fn local_device_id(&self) -> String {
        self.config.device_id.clone()
    }

    /// Deliver one envelope to a device: loopback for the local id, the
    /// direct stream when one exists, otherwise routed through the primary.
    /// `false` means delivery is not possible right now.
    fn send_envelope(&self, target_device_id: &str, envelope: Envelope) -> bool {
        if !self.is_running() {
            return false;
        }
        if target_device_id == self.config.device_id {
            self.surface_incoming(envelope, Some(self.config.device_id.clone()), None);
            return true;
        }
        if let Some(connection_id) = self.transport.connection_for_device(target_device_id) {
            return self.transport.send_to_connection(&connection_id, &envelope);
        }
        // No direct stream: a secondary can relay through the primary.
        if !self.table.is_local_primary() {
            if let Some(primary_id) = self.table.primary_id() {
                if let Some(primary_connection) = self.transport.connection_for_device(&primary_id)
                {
                    let wrapped = Envelope::new(
                        MESH_NAMESPACE,
                        mesh_kind::ROUTE_MESSAGE,
                        match serde_json::to_value(RouteMessage {
                            target_device_id: target_device_id.to_string(),
                            envelope,
                        }) {
                            Ok(value) => value,
                            Err(e) => {
                                warn!(error = %e, "failed to wrap routed message");
                                return false;
                            }
                        },
                    );
                    return self.transport.send_to_connection(&primary_connection, &wrapped);
                }
            }
        }
        false
    }

    /// Broadcast one envelope to every device. A primary fans out directly;
    /// a secondary hands the fan-out to the primary. Either way the message
    /// surfaces locally, so applications never special-case self-broadcast.
    fn broadcast_envelope(&self, envelope: Envelope) -> bool {
        if !self.is_running() {
            return false;
        }
        if self.table.is_local_primary() {
            for (connection_id, _device) in self.transport.bound_connections() {
                self.transport.send_to_connection(&connection_id, &envelope);
            }
            self.surface_incoming(
                envelope,
                Some(self.config.device_id.clone()),
                None,
            );
            return true;
        }
        let Some(primary_id) = self.table.primary_id() else {
            return false;
        };
        let Some(primary_connection) = self.transport.connection_for_device(&primary_id) else {
            return false;
        };
        let wrapped = Envelope::new(
            MESH_NAMESPACE,
            mesh_kind::ROUTE_BROADCAST,
            match serde_json::to_value(RouteBroadcast {
                envelope: envelope.clone(),
            }) {
                Ok(value) => value,
                Err(e) => {
                    warn!(error = %e, "failed to wrap routed broadcast");
                    return false;
                }
            },
        );
        let sent = self.transport.send_to_connection(&primary_connection, &wrapped);
        if sent {
            // The primary excludes the origin from its fan-out, so loopback
            // happens here exactly once.
            self.surface_incoming(envelope, Some(self.config.device_id.clone()), None);
        }
        sent
    }
}
