use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use weft_core::{Envelope, EventBus, now_ms};
use weft_mesh::{EnvelopeSender, IncomingMessage, MessageBus};
use weft_sync::{DeviceSlice, StoreSyncAdapter, SyncStore};

// ── Test doubles ───────────────────────────────────────────────

/// In-memory store with the strictly-greater version gate.
struct MemoryStore {
    local: Mutex<Option<DeviceSlice>>,
    remotes: Mutex<HashMap<String, DeviceSlice>>,
    removals: Mutex<Vec<(String, String)>>,
    cleared: AtomicUsize,
    applied: AtomicUsize,
    changes_tx: broadcast::Sender<DeviceSlice>,
}

impl MemoryStore {
    fn new() -> Arc<Self> {
        let (changes_tx, _) = broadcast::channel(16);
        Arc::new(Self {
            local: Mutex::new(None),
            remotes: Mutex::new(HashMap::new()),
            removals: Mutex::new(Vec::new()),
            cleared: AtomicUsize::new(0),
            applied: AtomicUsize::new(0),
            changes_tx,
        })
    }

    fn set_local(&self, device_id: &str, data: serde_json::Value, version: u64) {
        let slice = DeviceSlice {
            device_id: device_id.into(),
            data,
            version,
            updated_at: now_ms(),
        };
        *self.local.lock() = Some(slice.clone());
        let _ = self.changes_tx.send(slice);
    }

    fn remote_version(&self, device_id: &str) -> Option<u64> {
        self.remotes.lock().get(device_id).map(|s| s.version)
    }
}

impl SyncStore for MemoryStore {
    fn local_slice(&self) -> Option<DeviceSlice> {
        self.local.lock().clone()
    }

    fn apply_remote_slice(&self, slice: DeviceSlice) -> bool {
        let mut remotes = self.remotes.lock();
        let current = remotes.get(&slice.device_id).map(|s| s.version);
        if current.is_some_and(|v| v >= slice.version) {
            return false;
        }
        remotes.insert(slice.device_id.clone(), slice);
        self.applied.fetch_add(1, Ordering::SeqCst);
        true
    }

    fn remove_remote_slice(&self, device_id: &str, reason: &str) {
        self.remotes.lock().remove(device_id);
        self.removals
            .lock()
            .push((device_id.to_string(), reason.to_string()));
    }

    fn clear_remote_slices(&self) {
        self.remotes.lock().clear();
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }

    fn local_changes(&self) -> broadcast::Receiver<DeviceSlice> {
        self.changes_tx.subscribe()
    }
}

/// Delivers broadcasts straight into a peer bus, standing in for the mesh.
struct LinkedSender {
    local_id: String,
    peer: Mutex<Option<Arc<MessageBus>>>,
}

impl LinkedSender {
    fn new(local_id: &str) -> Arc<Self> {
        Arc::new(Self {
            local_id: local_id.into(),
            peer: Mutex::new(None),
        })
    }

    fn link(&self, peer: Arc<MessageBus>) {
        *self.peer.lock() = Some(peer);
    }
}

impl EnvelopeSender for LinkedSender {
    fn local_device_id(&self) -> String {
        self.local_id.clone()
    }

    fn send_envelope(&self, _target: &str, _envelope: Envelope) -> bool {
        false
    }

    fn broadcast_envelope(&self, envelope: Envelope) -> bool {
        let peer = self.peer.lock().clone();
        match peer {
            Some(peer_bus) => {
                peer_bus.dispatch(&IncomingMessage {
                    from: Some(self.local_id.clone()),
                    connection_id: Some("linked".into()),
                    namespace: envelope.namespace,
                    kind: envelope.kind,
                    payload: envelope.payload,
                    timestamp: envelope.timestamp,
                });
                true
            }
            None => false,
        }
    }
}

struct Side {
    _sender_keepalive: Arc<dyn EnvelopeSender>,
    sender: Arc<LinkedSender>,
    bus: Arc<MessageBus>,
    adapter: Arc<StoreSyncAdapter>,
    store: Arc<MemoryStore>,
}

fn side(device_id: &str) -> Side {
    let sender = LinkedSender::new(device_id);
    let as_dyn: Arc<dyn EnvelopeSender> = Arc::clone(&sender) as Arc<dyn EnvelopeSender>;
    let bus = MessageBus::new(Arc::downgrade(&as_dyn), EventBus::default());
    let adapter = StoreSyncAdapter::new(Arc::clone(&bus), EventBus::default());
    let store = MemoryStore::new();
    adapter.register_store("tasks", Arc::clone(&store) as Arc<dyn SyncStore>);
    Side {
        _sender_keepalive: as_dyn,
        sender,
        bus,
        adapter,
        store,
    }
}

// ── Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn full_lifecycle_between_two_devices() {
    let a = side("dev-a");
    let b = side("dev-b");
    a.sender.link(Arc::clone(&b.bus));
    b.sender.link(Arc::clone(&a.bus));

    // A holds a slice and starts first; its initial offer reaches nobody.
    a.store
        .set_local("dev-a", serde_json::json!({"items": ["a"]}), 1);
    a.adapter.start();
    assert!(b.store.remote_version("dev-a").is_none());

    // B starts later: its request makes A re-offer, and B applies once.
    b.adapter.start();
    assert_eq!(b.store.remote_version("dev-a"), Some(1));
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 1);

    // An incremental local change on A flows as an update.
    a.store
        .set_local("dev-a", serde_json::json!({"items": ["a", "b"]}), 2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(b.store.remote_version("dev-a"), Some(2));
    assert_eq!(b.store.applied.load(Ordering::SeqCst), 2);

    // A goes offline: B evicts locally and tells the mesh; A ignores the
    // clear naming itself.
    b.adapter.handle_device_offline("dev-a");
    assert!(b.store.remote_version("dev-a").is_none());
    assert_eq!(
        b.store.removals.lock().as_slice(),
        &[("dev-a".to_string(), "offline".to_string())]
    );
    assert!(a.store.removals.lock().is_empty());
}

#[tokio::test]
async fn stale_versions_are_a_noop() {
    let a = side("dev-a");
    let b = side("dev-b");
    a.sender.link(Arc::clone(&b.bus));
    b.sender.link(Arc::clone(&a.bus));

    a.store
        .set_local("dev-a", serde_json::json!({"v": "new"}), 5);
    a.adapter.start();
    b.adapter.start();
    assert_eq!(b.store.remote_version("dev-a"), Some(5));
    let applied = b.store.applied.load(Ordering::SeqCst);

    // Replay an older snapshot straight into B's bus.
    b.bus.dispatch(&IncomingMessage {
        from: Some("dev-a".into()),
        connection_id: None,
        namespace: "sync".into(),
        kind: "store:sync:full".into(),
        payload: serde_json::json!({
            "storeId": "tasks",
            "slice": {
                "deviceId": "dev-a",
                "data": {"v": "old"},
                "version": 3,
                "updatedAt": 0
            }
        }),
        timestamp: None,
    });
    assert_eq!(b.store.remote_version("dev-a"), Some(5));
    assert_eq!(b.store.applied.load(Ordering::SeqCst), applied);
}

#[tokio::test]
async fn targeted_request_is_only_answered_by_the_named_device() {
    let a = side("dev-a");
    let b = side("dev-b");
    a.sender.link(Arc::clone(&b.bus));
    b.sender.link(Arc::clone(&a.bus));

    a.store.set_local("dev-a", serde_json::json!({"n": 1}), 1);
    a.adapter.start();
    b.adapter.start();
    let applied = b.store.applied.load(Ordering::SeqCst);

    // A request aimed at someone else is ignored by A.
    a.bus.dispatch(&IncomingMessage {
        from: Some("dev-b".into()),
        connection_id: None,
        namespace: "sync".into(),
        kind: "store:sync:request".into(),
        payload: serde_json::json!({"storeId": "tasks", "fromDeviceId": "dev-z"}),
        timestamp: None,
    });
    assert_eq!(b.store.applied.load(Ordering::SeqCst), applied);

    // Aimed at A, it answers (B's gate drops the equal version though).
    a.bus.dispatch(&IncomingMessage {
        from: Some("dev-b".into()),
        connection_id: None,
        namespace: "sync".into(),
        kind: "store:sync:request".into(),
        payload: serde_json::json!({"storeId": "tasks", "fromDeviceId": "dev-a"}),
        timestamp: None,
    });
    assert_eq!(b.store.remote_version("dev-a"), Some(1));
}

#[tokio::test]
async fn own_messages_and_unknown_stores_are_dropped() {
    let a = side("dev-a");
    a.adapter.start();

    // A slice from ourselves must not apply.
    a.bus.dispatch(&IncomingMessage {
        from: Some("dev-a".into()),
        connection_id: None,
        namespace: "sync".into(),
        kind: "store:sync:full".into(),
        payload: serde_json::json!({
            "storeId": "tasks",
            "slice": {"deviceId": "dev-a", "data": {}, "version": 9, "updatedAt": 0}
        }),
        timestamp: None,
    });
    assert_eq!(a.store.applied.load(Ordering::SeqCst), 0);

    // A slice for a store we do not host is dropped, not a crash.
    a.bus.dispatch(&IncomingMessage {
        from: Some("dev-b".into()),
        connection_id: None,
        namespace: "sync".into(),
        kind: "store:sync:update".into(),
        payload: serde_json::json!({
            "storeId": "nonexistent",
            "slice": {"deviceId": "dev-b", "data": {}, "version": 1, "updatedAt": 0}
        }),
        timestamp: None,
    });
    assert_eq!(a.store.applied.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn dispose_is_idempotent_and_leaves_the_adapter_inert() {
    let a = side("dev-a");
    let b = side("dev-b");
    a.sender.link(Arc::clone(&b.bus));
    b.sender.link(Arc::clone(&a.bus));

    a.store.set_local("dev-a", serde_json::json!({"n": 1}), 1);
    a.adapter.start();
    b.adapter.start();
    assert_eq!(b.store.remote_version("dev-a"), Some(1));

    b.adapter.dispose();
    b.adapter.dispose();
    assert_eq!(b.store.cleared.load(Ordering::SeqCst), 1);
    assert!(b.store.remote_version("dev-a").is_none());

    // A disposed adapter never comes back.
    b.adapter.start();
    a.store.set_local("dev-a", serde_json::json!({"n": 2}), 2);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(b.store.remote_version("dev-a").is_none());
}
