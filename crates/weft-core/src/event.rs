use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::device::{Device, DeviceRole};

/// Lifecycle events flowing out of the mesh: what applications and the CLI
/// observe without holding references into the components themselves.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MeshEvent {
    // ── Device table ───────────────────────────────────────────
    DeviceDiscovered {
        device: Device,
    },
    DeviceUpdated {
        device: Device,
    },
    DeviceOffline {
        device_id: String,
    },
    /// Debounced snapshot of the whole table.
    DevicesChanged {
        devices: Vec<Device>,
    },
    PrimaryChanged {
        primary_id: Option<String>,
    },
    LocalDeviceChanged {
        device: Device,
    },

    // ── Node ───────────────────────────────────────────────────
    RoleChanged {
        role: Option<DeviceRole>,
    },
    AuthRequired {
        auth_url: String,
    },

    // ── Transport ──────────────────────────────────────────────
    ConnectionUp {
        connection_id: String,
        device_id: Option<String>,
    },
    ConnectionDown {
        connection_id: String,
        reason: String,
    },

    // ── Message bus ────────────────────────────────────────────
    SubscriberError {
        namespace: String,
        error: String,
    },
    NamespaceUnsubscribed {
        namespace: String,
    },

    // ── Store sync ─────────────────────────────────────────────
    SliceApplied {
        store_id: String,
        device_id: String,
        version: u64,
    },
    SliceEvicted {
        store_id: String,
        device_id: String,
        reason: String,
    },
}

/// A broadcast-based event bus for mesh-wide lifecycle events.
///
/// Publishing with no subscribers is a no-op, never an error.
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<MeshEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish(&self, event: MeshEvent) {
        // Ignore send errors (no subscribers).
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
