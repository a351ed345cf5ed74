use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_core::{EventBus, MeshEvent};
use weft_mesh::{IncomingMessage, MessageBus, Subscription};

use crate::store::{DeviceSlice, SyncStore};

/// Namespace all replication traffic rides on.
pub const SYNC_NAMESPACE: &str = "sync";

mod kind {
    pub const FULL: &str = "store:sync:full";
    pub const UPDATE: &str = "store:sync:update";
    pub const REQUEST: &str = "store:sync:request";
    pub const CLEAR: &str = "store:sync:clear";
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SlicePayload {
    store_id: String,
    slice: DeviceSlice,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RequestPayload {
    store_id: String,
    #[serde(default)]
    from_device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClearPayload {
    store_id: String,
    device_id: String,
    #[serde(default)]
    reason: Option<String>,
}

struct AdapterInner {
    stores: HashMap<String, Arc<dyn SyncStore>>,
    subscription: Option<Subscription>,
    forwarders: Vec<JoinHandle<()>>,
    started: bool,
    disposed: bool,
}

/// Replicates per-device slices of registered stores across the mesh.
///
/// On start it asks every peer for their snapshots and offers its own; local
/// changes broadcast incrementally; peers that vanish get their slices
/// evicted. Disposed adapters are inert; `start()` after `dispose()` is a
/// no-op.
pub struct StoreSyncAdapter {
    bus: Arc<MessageBus>,
    events: EventBus,
    inner: Mutex<AdapterInner>,
}

impl StoreSyncAdapter {
    pub fn new(bus: Arc<MessageBus>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            events,
            inner: Mutex::new(AdapterInner {
                stores: HashMap::new(),
                subscription: None,
                forwarders: Vec::new(),
                started: false,
                disposed: false,
            }),
        })
    }

    /// Register a store before `start()`. Later registrations still work but
    /// miss the initial snapshot exchange.
    pub fn register_store(&self, store_id: impl Into<String>, store: Arc<dyn SyncStore>) {
        self.inner.lock().stores.insert(store_id.into(), store);
    }

    pub fn start(self: &Arc<Self>) {
        let stores: Vec<(String, Arc<dyn SyncStore>)> = {
            let mut inner = self.inner.lock();
            if inner.started || inner.disposed {
                return;
            }
            inner.started = true;

            let adapter = Arc::downgrade(self);
            inner.subscription = Some(self.bus.subscribe(SYNC_NAMESPACE, move |message| {
                if let Some(adapter) = adapter.upgrade() {
                    adapter.handle_message(message);
                }
                Ok(())
            }));

            let stores: Vec<(String, Arc<dyn SyncStore>)> = inner
                .stores
                .iter()
                .map(|(id, s)| (id.clone(), Arc::clone(s)))
                .collect();
            for (store_id, store) in &stores {
                let forwarder = self.spawn_forwarder(store_id.clone(), Arc::clone(store));
                inner.forwarders.push(forwarder);
            }
            stores
        };

        // Ask everyone for their slices, then offer ours.
        for (store_id, _) in &stores {
            self.broadcast_request(store_id, None);
        }
        for (store_id, store) in &stores {
            self.broadcast_slice(kind::FULL, store_id, store.as_ref());
        }
    }

    /// Detach from the bus and stop forwarding; store contents are left
    /// alone.
    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        for task in inner.forwarders.drain(..) {
            task.abort();
        }
        // Dropping the guard unsubscribes from the bus.
        inner.subscription = None;
        inner.started = false;
    }

    /// Stop and evict every remote slice. Safe to call twice.
    pub fn dispose(&self) {
        self.stop();
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        for store in inner.stores.values() {
            store.clear_remote_slices();
        }
    }

    // ── Device lifecycle hooks (wired by the application) ──────

    /// A device joined: offer our snapshots and ask that device for its own.
    pub fn handle_device_discovered(&self, device_id: &str) {
        if !self.active() {
            return;
        }
        let stores = self.store_snapshot();
        for (store_id, store) in &stores {
            self.broadcast_slice(kind::FULL, store_id, store.as_ref());
        }
        for (store_id, _) in &stores {
            self.broadcast_request(store_id, Some(device_id));
        }
    }

    /// A device left: evict its slices locally and tell the others.
    pub fn handle_device_offline(&self, device_id: &str) {
        if !self.active() {
            return;
        }
        let stores = self.store_snapshot();
        for (store_id, store) in &stores {
            store.remove_remote_slice(device_id, "offline");
            self.events.publish(MeshEvent::SliceEvicted {
                store_id: store_id.clone(),
                device_id: device_id.to_string(),
                reason: "offline".into(),
            });
            self.bus.broadcast(
                SYNC_NAMESPACE,
                kind::CLEAR,
                serde_json::json!({
                    "storeId": store_id,
                    "deviceId": device_id,
                    "reason": "offline",
                }),
            );
        }
    }

    // ── Incoming ───────────────────────────────────────────────

    fn handle_message(&self, message: &IncomingMessage) {
        match message.kind.as_str() {
            kind::FULL | kind::UPDATE => self.on_slice(message),
            kind::REQUEST => self.on_request(message),
            kind::CLEAR => self.on_clear(message),
            other => debug!(kind = other, "unknown sync message ignored"),
        }
    }

    fn on_slice(&self, message: &IncomingMessage) {
        let Some(from) = message.from.as_deref().filter(|f| !f.is_empty()) else {
            return;
        };
        if Some(from.to_string()) == self.bus.local_device_id() {
            return;
        }
        let payload: SlicePayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed sync slice dropped");
                return;
            }
        };
        let Some(store) = self.store(&payload.store_id) else {
            warn!(store = %payload.store_id, "sync message for unknown store dropped");
            return;
        };
        let store_id = payload.store_id;
        let device_id = payload.slice.device_id.clone();
        let version = payload.slice.version;
        if store.apply_remote_slice(payload.slice) {
            debug!(store = %store_id, device = %device_id, version, "remote slice applied");
            self.events.publish(MeshEvent::SliceApplied {
                store_id,
                device_id,
                version,
            });
        }
    }

    fn on_request(&self, message: &IncomingMessage) {
        let local_id = self.bus.local_device_id();
        let Some(from) = message.from.as_deref().filter(|f| !f.is_empty()) else {
            return;
        };
        if Some(from.to_string()) == local_id {
            return;
        }
        let payload: RequestPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed sync request dropped");
                return;
            }
        };
        // A targeted request is only answered by the named device.
        if let Some(target) = &payload.from_device_id {
            if Some(target.clone()) != local_id {
                return;
            }
        }
        let Some(store) = self.store(&payload.store_id) else {
            warn!(store = %payload.store_id, "sync request for unknown store dropped");
            return;
        };
        self.broadcast_slice(kind::FULL, &payload.store_id, store.as_ref());
    }

    fn on_clear(&self, message: &IncomingMessage) {
        let payload: ClearPayload = match serde_json::from_value(message.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "malformed sync clear dropped");
                return;
            }
        };
        if Some(payload.device_id.clone()) == self.bus.local_device_id() {
            return;
        }
        let Some(store) = self.store(&payload.store_id) else {
            warn!(store = %payload.store_id, "sync clear for unknown store dropped");
            return;
        };
        let reason = payload.reason.as_deref().unwrap_or("cleared");
        store.remove_remote_slice(&payload.device_id, reason);
        self.events.publish(MeshEvent::SliceEvicted {
            store_id: payload.store_id,
            device_id: payload.device_id,
            reason: reason.to_string(),
        });
    }

    // ── Outgoing ───────────────────────────────────────────────

    fn spawn_forwarder(
        self: &Arc<Self>,
        store_id: String,
        store: Arc<dyn SyncStore>,
    ) -> JoinHandle<()> {
        let adapter = Arc::downgrade(self);
        let mut changes = store.local_changes();
        tokio::spawn(async move {
            loop {
                match changes.recv().await {
                    Ok(slice) => {
                        let Some(adapter) = adapter.upgrade() else {
                            return;
                        };
                        adapter.bus.broadcast(
                            SYNC_NAMESPACE,
                            kind::UPDATE,
                            serde_json::json!({ "storeId": store_id, "slice": slice }),
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(store = %store_id, skipped, "local change feed lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }

    fn broadcast_slice(&self, message_kind: &str, store_id: &str, store: &dyn SyncStore) {
        let Some(slice) = store.local_slice() else {
            return;
        };
        self.bus.broadcast(
            SYNC_NAMESPACE,
            message_kind,
            serde_json::json!({ "storeId": store_id, "slice": slice }),
        );
    }

    fn broadcast_request(&self, store_id: &str, from_device_id: Option<&str>) {
        let mut payload = serde_json::json!({ "storeId": store_id });
        if let Some(from_device_id) = from_device_id {
            payload["fromDeviceId"] = serde_json::json!(from_device_id);
        }
        self.bus.broadcast(SYNC_NAMESPACE, kind::REQUEST, payload);
    }

    fn active(&self) -> bool {
        let inner = self.inner.lock();
        inner.started && !inner.disposed
    }

    fn store(&self, store_id: &str) -> Option<Arc<dyn SyncStore>> {
        self.inner.lock().stores.get(store_id).cloned()
    }

    fn store_snapshot(&self) -> Vec<(String, Arc<dyn SyncStore>)> {
        self.inner
            .lock()
            .stores
            .iter()
            .map(|(id, s)| (id.clone(), Arc::clone(s)))
            .collect()
    }
}
