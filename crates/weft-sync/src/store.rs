use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use weft_core::now_ms;

/// One device's owned portion of an application store, versioned
/// monotonically per device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSlice {
    pub device_id: String,
    pub data: serde_json::Value,
    pub version: u64,
    /// Milliseconds since the Unix epoch.
    pub updated_at: i64,
}

/// Contract an application store implements to take part in replication.
///
/// The store owns the slices; the sync adapter holds no copies. For a given
/// device id the effective version must be non-decreasing:
/// `apply_remote_slice` applies only versions strictly greater than the one
/// currently held and reports whether it applied.
pub trait SyncStore: Send + Sync {
    /// The local device's slice, if it has one yet.
    fn local_slice(&self) -> Option<DeviceSlice>;

    /// Apply a remote device's slice. Equal or lower versions are a no-op
    /// (`false`).
    fn apply_remote_slice(&self, slice: DeviceSlice) -> bool;

    /// Evict one remote device's slice.
    fn remove_remote_slice(&self, device_id: &str, reason: &str);

    /// Evict every remote slice.
    fn clear_remote_slices(&self);

    /// Change feed for the local slice; each mutation publishes the new
    /// slice (with a bumped version).
    fn local_changes(&self) -> broadcast::Receiver<DeviceSlice>;
}

/// In-memory [`SyncStore`] holding opaque JSON data.
///
/// Suits applications whose state fits in one JSON document per device.
/// `update_local` bumps the version and feeds the change stream; remote
/// slices pass the strictly-greater version gate.
pub struct MemorySliceStore {
    device_id: String,
    local: Mutex<Option<DeviceSlice>>,
    remotes: Mutex<HashMap<String, DeviceSlice>>,
    changes_tx: broadcast::Sender<DeviceSlice>,
}

impl MemorySliceStore {
    pub fn new(device_id: impl Into<String>) -> Self {
        let (changes_tx, _) = broadcast::channel(64);
        Self {
            device_id: device_id.into(),
            local: Mutex::new(None),
            remotes: Mutex::new(HashMap::new()),
            changes_tx,
        }
    }

    /// Replace the local slice's data, bump its version, and publish the
    /// change.
    pub fn update_local(&self, data: serde_json::Value) -> DeviceSlice {
        let slice = {
            let mut local = self.local.lock();
            let version = local.as_ref().map(|s| s.version + 1).unwrap_or(1);
            let slice = DeviceSlice {
                device_id: self.device_id.clone(),
                data,
                version,
                updated_at: now_ms(),
            };
            *local = Some(slice.clone());
            slice
        };
        // No subscribers is fine; the adapter attaches one on start.
        let _ = self.changes_tx.send(slice.clone());
        slice
    }

    pub fn remote_slice(&self, device_id: &str) -> Option<DeviceSlice> {
        self.remotes.lock().get(device_id).cloned()
    }

    pub fn remote_slices(&self) -> Vec<DeviceSlice> {
        self.remotes.lock().values().cloned().collect()
    }
}

impl SyncStore for MemorySliceStore {
    fn local_slice(&self) -> Option<DeviceSlice> {
        self.local.lock().clone()
    }

    fn apply_remote_slice(&self, slice: DeviceSlice) -> bool {
        let mut remotes = self.remotes.lock();
        let held = remotes.get(&slice.device_id).map(|s| s.version);
        if held.is_some_and(|v| v >= slice.version) {
            return false;
        }
        remotes.insert(slice.device_id.clone(), slice);
        true
    }

    fn remove_remote_slice(&self, device_id: &str, _reason: &str) {
        self.remotes.lock().remove(device_id);
    }

    fn clear_remote_slices(&self) {
        self.remotes.lock().clear();
    }

    fn local_changes(&self) -> broadcast::Receiver<DeviceSlice> {
        self.changes_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_local_bumps_versions_monotonically() {
        let store = MemorySliceStore::new("dev-a");
        assert!(store.local_slice().is_none());
        let first = store.update_local(serde_json::json!({"n": 1}));
        let second = store.update_local(serde_json::json!({"n": 2}));
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.local_slice().unwrap().data["n"], 2);
    }

    #[test]
    fn remote_apply_is_gated_on_strictly_greater_versions() {
        let store = MemorySliceStore::new("dev-a");
        let slice = |version| DeviceSlice {
            device_id: "dev-b".into(),
            data: serde_json::json!({"v": version}),
            version,
            updated_at: 0,
        };
        assert!(store.apply_remote_slice(slice(3)));
        assert!(!store.apply_remote_slice(slice(3)));
        assert!(!store.apply_remote_slice(slice(2)));
        assert!(store.apply_remote_slice(slice(4)));
        assert_eq!(store.remote_slice("dev-b").unwrap().version, 4);
    }

    #[tokio::test]
    async fn local_changes_feed_delivers_updates() {
        let store = MemorySliceStore::new("dev-a");
        let mut changes = store.local_changes();
        store.update_local(serde_json::json!({"n": 1}));
        let slice = changes.recv().await.unwrap();
        assert_eq!(slice.device_id, "dev-a");
        assert_eq!(slice.version, 1);
    }
}
