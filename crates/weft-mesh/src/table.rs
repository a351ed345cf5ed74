use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_core::{Device, DeviceRole, DeviceStatus, now_ms, parse_hostname};
use weft_overlay::TailnetPeer;

/// Coalescing window for the `DevicesChanged` snapshot.
const CHANGE_DEBOUNCE: Duration = Duration::from_millis(100);

/// What the table reports to the mesh node.
#[derive(Debug, Clone)]
pub enum TableEvent {
    DeviceDiscovered(Device),
    DeviceUpdated(Device),
    DeviceOffline { device_id: String },
    DevicesChanged(Vec<Device>),
    PrimaryChanged(Option<String>),
    LocalDeviceChanged(Device),
}

struct TableInner {
    local: Device,
    remotes: HashMap<String, Device>,
    primary_id: Option<String>,
    debounce: Option<JoinHandle<()>>,
}

/// The device table: the local device, every known remote keyed by id, and
/// the current primary. Devices are never removed implicitly — going offline
/// keeps the row (status `offline`) so a returning device is recognized.
pub struct DeviceTable {
    prefix: String,
    inner: Mutex<TableInner>,
    events_tx: mpsc::Sender<TableEvent>,
}

impl DeviceTable {
    pub fn new(local: Device, prefix: impl Into<String>) -> (Arc<Self>, mpsc::Receiver<TableEvent>) {
        let (events_tx, events_rx) = mpsc::channel(256);
        let table = Arc::new(Self {
            prefix: prefix.into(),
            inner: Mutex::new(TableInner {
                local,
                remotes: HashMap::new(),
                primary_id: None,
                debounce: None,
            }),
            events_tx,
        });
        (table, events_rx)
    }

    // ── Local device ───────────────────────────────────────────

    pub fn local_device(&self) -> Device {
        self.inner.lock().local.clone()
    }

    pub fn local_id(&self) -> String {
        self.inner.lock().local.id.clone()
    }

    pub fn set_local_online(self: &Arc<Self>, ip: Option<String>, dns_name: Option<String>) {
        let local = {
            let mut inner = self.inner.lock();
            inner.local.status = DeviceStatus::Online;
            if ip.is_some() {
                inner.local.ip = ip;
            }
            if dns_name.as_deref().is_some_and(|d| !d.is_empty()) {
                inner.local.dns_name = dns_name;
            }
            inner.local.last_seen = now_ms();
            inner.local.clone()
        };
        self.emit(TableEvent::LocalDeviceChanged(local));
        self.mark_changed();
    }

    pub fn set_local_offline(self: &Arc<Self>) {
        let local = {
            let mut inner = self.inner.lock();
            inner.local.status = DeviceStatus::Offline;
            inner.local.clone()
        };
        self.emit(TableEvent::LocalDeviceChanged(local));
        self.mark_changed();
    }

    pub fn set_local_started_at(&self, started_at: i64) {
        self.inner.lock().local.started_at = Some(started_at);
    }

    pub fn set_local_role(self: &Arc<Self>, role: Option<DeviceRole>) {
        let changed = {
            let mut inner = self.inner.lock();
            let changed = inner.local.role != role;
            inner.local.role = role;
            changed.then(|| inner.local.clone())
        };
        if let Some(local) = changed {
            self.emit(TableEvent::LocalDeviceChanged(local));
            self.mark_changed();
        }
    }

    pub fn update_device_name(self: &Arc<Self>, name: impl Into<String>) {
        let local = {
            let mut inner = self.inner.lock();
            inner.local.name = name.into();
            inner.local.clone()
        };
        self.emit(TableEvent::LocalDeviceChanged(local));
        self.mark_changed();
    }

    pub fn update_metadata(self: &Arc<Self>, metadata: HashMap<String, serde_json::Value>) {
        let local = {
            let mut inner = self.inner.lock();
            inner.local.metadata.extend(metadata);
            inner.local.clone()
        };
        self.emit(TableEvent::LocalDeviceChanged(local));
        self.mark_changed();
    }

    pub fn set_local_dns_name(self: &Arc<Self>, dns_name: impl Into<String>) {
        let local = {
            let mut inner = self.inner.lock();
            inner.local.dns_name = Some(dns_name.into());
            inner.local.clone()
        };
        self.emit(TableEvent::LocalDeviceChanged(local));
        self.mark_changed();
    }

    // ── Peer discovery ─────────────────────────────────────────

    /// Fold a tailnet peer listing into the table. Hostnames that do not
    /// match `{prefix}-{type}-{id}`, and our own, are not ours and are
    /// skipped. A previously learned `dnsName` survives an empty one.
    pub fn handle_peer_list(self: &Arc<Self>, peers: &[TailnetPeer]) {
        use std::collections::hash_map::Entry;

        let mut events = Vec::new();
        {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut went_offline = Vec::new();
            for peer in peers {
                let Some((device_type, id)) = parse_hostname(&self.prefix, &peer.hostname) else {
                    continue;
                };
                if id == inner.local.id || peer.hostname == inner.local.hostname {
                    continue;
                }
                match inner.remotes.entry(id.clone()) {
                    Entry::Occupied(mut entry) => {
                        let device = entry.get_mut();
                        device.hostname = peer.hostname.clone();
                        if peer.dns_name.as_deref().is_some_and(|d| !d.is_empty()) {
                            device.dns_name = peer.dns_name.clone();
                        }
                        if let Some(ip) = peer.tailscale_ips.first() {
                            device.ip = Some(ip.clone());
                        }
                        if peer.os.is_some() {
                            device.os = peer.os.clone();
                        }
                        device.last_seen = now_ms();
                        if peer.online {
                            let was_offline = device.status == DeviceStatus::Offline;
                            device.status = DeviceStatus::Online;
                            if was_offline {
                                events.push(TableEvent::DeviceDiscovered(device.clone()));
                            } else {
                                events.push(TableEvent::DeviceUpdated(device.clone()));
                            }
                        } else if device.status == DeviceStatus::Online {
                            went_offline.push(id);
                        }
                    }
                    Entry::Vacant(entry) => {
                        let mut device =
                            Device::new(id, device_type, peer.hostname.clone(), &self.prefix);
                        device.dns_name = peer.dns_name.clone().filter(|d| !d.is_empty());
                        device.ip = peer.tailscale_ips.first().cloned();
                        device.os = peer.os.clone();
                        device.status = if peer.online {
                            DeviceStatus::Online
                        } else {
                            DeviceStatus::Offline
                        };
                        if device.status == DeviceStatus::Online {
                            events.push(TableEvent::DeviceDiscovered(device.clone()));
                        }
                        entry.insert(device);
                    }
                }
            }
            for id in went_offline {
                Self::offline_locked(inner, &id, &mut events);
            }
        }
        let changed = !events.is_empty();
        for event in events {
            self.emit(event);
        }
        if changed {
            self.mark_changed();
        }
    }

    // ── Control-plane handlers ─────────────────────────────────

    /// Insert or replace a device from a `device:announce`/`device:update`.
    pub fn handle_device_announce(self: &Arc<Self>, from: &str, mut device: Device) {
        if device.id.is_empty() {
            warn!(from, "announce with empty device id dropped");
            return;
        }
        let event = {
            let mut inner = self.inner.lock();
            if device.id == inner.local.id {
                return;
            }
            device.status = DeviceStatus::Online;
            device.last_seen = now_ms();
            let is_new = !inner.remotes.contains_key(&device.id);
            if !is_new && device.dns_name.as_deref().unwrap_or("").is_empty() {
                device.dns_name = inner
                    .remotes
                    .get(&device.id)
                    .and_then(|existing| existing.dns_name.clone());
            }
            let snapshot = device.clone();
            inner.remotes.insert(device.id.clone(), device);
            if is_new {
                TableEvent::DeviceDiscovered(snapshot)
            } else {
                TableEvent::DeviceUpdated(snapshot)
            }
        };
        self.emit(event);
        self.mark_changed();
    }

    /// Apply a `device:list` snapshot from the primary: upsert every
    /// non-local device, adopt the stated primary, and realign every role.
    /// Idempotent for equal inputs.
    pub fn handle_device_list(
        self: &Arc<Self>,
        from: &str,
        devices: Vec<Device>,
        primary_id: Option<String>,
    ) {
        debug!(from, count = devices.len(), "applying device list");
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            for mut device in devices {
                if device.id.is_empty() || device.id == inner.local.id {
                    continue;
                }
                if let Some(existing) = inner.remotes.get(&device.id) {
                    if device.dns_name.as_deref().unwrap_or("").is_empty() {
                        device.dns_name = existing.dns_name.clone();
                    }
                } else {
                    events.push(TableEvent::DeviceDiscovered(device.clone()));
                }
                inner.remotes.insert(device.id.clone(), device);
            }
            Self::apply_primary_locked(&mut inner, primary_id, &mut events);
        }
        for event in events {
            self.emit(event);
        }
        self.mark_changed();
    }

    /// Mark a device offline (goodbye, dead connection, or tailnet listing).
    /// If it was the primary, the primary becomes unset — the election
    /// coordinator picks that up and begins recovery.
    pub fn mark_device_offline(self: &Arc<Self>, device_id: &str) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            Self::offline_locked(&mut inner, device_id, &mut events);
        }
        let changed = !events.is_empty();
        for event in events {
            self.emit(event);
        }
        if changed {
            self.mark_changed();
        }
    }

    /// Adopt a primary decision, realigning every device's role.
    pub fn set_primary(self: &Arc<Self>, primary_id: Option<String>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            Self::apply_primary_locked(&mut inner, primary_id, &mut events);
        }
        for event in events {
            self.emit(event);
        }
        self.mark_changed();
    }

    // ── Lookups ────────────────────────────────────────────────

    pub fn get_device(&self, device_id: &str) -> Option<Device> {
        self.inner.lock().remotes.get(device_id).cloned()
    }

    /// Remote devices only.
    pub fn devices(&self) -> Vec<Device> {
        self.inner.lock().remotes.values().cloned().collect()
    }

    /// Local plus remotes, the `device:list` seeding shape.
    pub fn all_devices(&self) -> Vec<Device> {
        let inner = self.inner.lock();
        let mut out = Vec::with_capacity(inner.remotes.len() + 1);
        out.push(inner.local.clone());
        out.extend(inner.remotes.values().cloned());
        out
    }

    pub fn primary_id(&self) -> Option<String> {
        self.inner.lock().primary_id.clone()
    }

    pub fn is_local_primary(&self) -> bool {
        let inner = self.inner.lock();
        inner.primary_id.as_deref() == Some(inner.local.id.as_str())
    }

    /// Drop every remote and the primary. The local device keeps its
    /// identity; its role is cleared.
    pub fn reset(self: &Arc<Self>) {
        let mut events = Vec::new();
        {
            let mut inner = self.inner.lock();
            inner.remotes.clear();
            if inner.primary_id.take().is_some() {
                events.push(TableEvent::PrimaryChanged(None));
            }
            inner.local.role = None;
            if let Some(timer) = inner.debounce.take() {
                timer.abort();
            }
        }
        for event in events {
            self.emit(event);
        }
    }

    // ── Internals ──────────────────────────────────────────────

    fn offline_locked(inner: &mut TableInner, device_id: &str, events: &mut Vec<TableEvent>) {
        let Some(device) = inner.remotes.get_mut(device_id) else {
            return;
        };
        if device.status == DeviceStatus::Offline {
            return;
        }
        device.status = DeviceStatus::Offline;
        events.push(TableEvent::DeviceOffline {
            device_id: device_id.to_string(),
        });
        if inner.primary_id.as_deref() == Some(device_id) {
            inner.primary_id = None;
            events.push(TableEvent::PrimaryChanged(None));
        }
    }

    fn apply_primary_locked(
        inner: &mut TableInner,
        primary_id: Option<String>,
        events: &mut Vec<TableEvent>,
    ) {
        let changed = inner.primary_id != primary_id;
        inner.primary_id = primary_id.clone();

        let role_of = |id: &str| -> Option<DeviceRole> {
            primary_id.as_deref().map(|p| {
                if p == id {
                    DeviceRole::Primary
                } else {
                    DeviceRole::Secondary
                }
            })
        };
        let local_role = role_of(&inner.local.id);
        if inner.local.role != local_role {
            inner.local.role = local_role;
            events.push(TableEvent::LocalDeviceChanged(inner.local.clone()));
        }
        for device in inner.remotes.values_mut() {
            device.role = role_of(&device.id);
        }
        if changed {
            events.push(TableEvent::PrimaryChanged(inner.primary_id.clone()));
        }
    }

    fn emit(&self, event: TableEvent) {
        if self.events_tx.try_send(event).is_err() {
            warn!("device table event buffer full, dropping event");
        }
    }

    /// Debounced `DevicesChanged` snapshot: many mutations in one burst
    /// produce a single event.
    fn mark_changed(self: &Arc<Self>) {
        let mut inner = self.inner.lock();
        if inner.debounce.is_some() {
            return;
        }
        let table = Arc::clone(self);
        inner.debounce = Some(tokio::spawn(async move {
            tokio::time::sleep(CHANGE_DEBOUNCE).await;
            let snapshot = {
                let mut inner = table.inner.lock();
                inner.debounce = None;
                let mut all = vec![inner.local.clone()];
                all.extend(inner.remotes.values().cloned());
                all
            };
            table.emit(TableEvent::DevicesChanged(snapshot));
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (Arc<DeviceTable>, mpsc::Receiver<TableEvent>) {
        let mut local = Device::new("dev-local", "desktop", "local", "weft");
        local.status = DeviceStatus::Online;
        DeviceTable::new(local, "weft")
    }

    fn peer(hostname: &str, online: bool) -> TailnetPeer {
        serde_json::from_value(serde_json::json!({
            "id": hostname,
            "hostname": hostname,
            "dnsName": format!("{hostname}.tail.ts.net"),
            "tailscaleIPs": ["100.64.0.7"],
            "online": online,
            "os": "linux"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn one_row_per_device_id() {
        let (table, _rx) = table();
        table.handle_peer_list(&[peer("weft-phone-dev-b", true)]);
        table.handle_peer_list(&[peer("weft-phone-dev-b", true)]);
        table.handle_device_announce("dev-b", Device::new("dev-b", "phone", "b", "weft"));
        assert_eq!(table.devices().len(), 1);
    }

    #[tokio::test]
    async fn foreign_and_local_hostnames_are_skipped() {
        let (table, _rx) = table();
        table.handle_peer_list(&[
            peer("other-phone-x", true),
            peer("weft-desktop", true),
            peer("weft-desktop-dev-local", true),
        ]);
        assert!(table.devices().is_empty());
    }

    #[tokio::test]
    async fn announce_preserves_known_dns_name() {
        let (table, _rx) = table();
        table.handle_peer_list(&[peer("weft-phone-dev-b", true)]);
        assert_eq!(
            table.get_device("dev-b").unwrap().dns_name.as_deref(),
            Some("weft-phone-dev-b.tail.ts.net")
        );

        // A later announce without a dnsName keeps the learned one.
        let announced = Device::new("dev-b", "phone", "my phone", "weft");
        table.handle_device_announce("dev-b", announced);
        let device = table.get_device("dev-b").unwrap();
        assert_eq!(device.name, "my phone");
        assert_eq!(
            device.dns_name.as_deref(),
            Some("weft-phone-dev-b.tail.ts.net")
        );
    }

    #[tokio::test]
    async fn device_list_assigns_roles_and_primary() {
        let (table, mut rx) = table();
        let mut a = Device::new("dev-a", "desktop", "a", "weft");
        a.status = DeviceStatus::Online;
        table.handle_device_list("dev-a", vec![a], Some("dev-a".into()));

        assert_eq!(table.primary_id().as_deref(), Some("dev-a"));
        assert!(!table.is_local_primary());
        assert_eq!(
            table.get_device("dev-a").unwrap().role,
            Some(DeviceRole::Primary)
        );
        assert_eq!(table.local_device().role, Some(DeviceRole::Secondary));

        let mut saw_primary_change = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TableEvent::PrimaryChanged(Some(ref p)) if p == "dev-a") {
                saw_primary_change = true;
            }
        }
        assert!(saw_primary_change);
    }

    #[tokio::test]
    async fn device_list_is_idempotent() {
        let (table, mut rx) = table();
        let mut a = Device::new("dev-a", "desktop", "a", "weft");
        a.status = DeviceStatus::Online;
        table.handle_device_list("dev-a", vec![a.clone()], Some("dev-a".into()));
        while rx.try_recv().is_ok() {}

        table.handle_device_list("dev-a", vec![a], Some("dev-a".into()));
        while let Ok(event) = rx.try_recv() {
            assert!(
                !matches!(event, TableEvent::PrimaryChanged(_)),
                "reapplying an identical list must not re-announce the primary"
            );
        }
    }

    #[tokio::test]
    async fn offline_primary_unsets_primary() {
        let (table, mut rx) = table();
        let mut b = Device::new("dev-b", "phone", "b", "weft");
        b.status = DeviceStatus::Online;
        table.handle_device_list("dev-b", vec![b], Some("dev-b".into()));
        while rx.try_recv().is_ok() {}

        table.mark_device_offline("dev-b");
        assert!(table.primary_id().is_none());
        let device = table.get_device("dev-b").unwrap();
        assert_eq!(device.status, DeviceStatus::Offline);

        let mut saw_offline = false;
        let mut saw_primary_cleared = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TableEvent::DeviceOffline { ref device_id } if device_id == "dev-b" => {
                    saw_offline = true;
                }
                TableEvent::PrimaryChanged(None) => saw_primary_cleared = true,
                _ => {}
            }
        }
        assert!(saw_offline && saw_primary_cleared);
    }

    #[tokio::test(start_paused = true)]
    async fn devices_changed_is_debounced() {
        let (table, mut rx) = table();
        table.handle_peer_list(&[peer("weft-phone-dev-b", true)]);
        table.handle_peer_list(&[peer("weft-tablet-dev-c", true)]);

        tokio::time::sleep(Duration::from_millis(250)).await;
        let mut snapshots = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, TableEvent::DevicesChanged(_)) {
                snapshots += 1;
            }
        }
        assert_eq!(snapshots, 1);
    }
}
