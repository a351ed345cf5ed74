use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use weft_core::{Envelope, EventBus, MeshEvent};

/// Where the bus hands envelopes for delivery. Implemented by the mesh node;
/// the bus holds it weakly, since observers must not outlive the composition
/// root.
pub trait EnvelopeSender: Send + Sync {
    fn local_device_id(&self) -> String;
    /// Deliver to one device (loopback when targeting the local id).
    /// `false` means delivery is not possible right now.
    fn send_envelope(&self, target_device_id: &str, envelope: Envelope) -> bool;
    /// Deliver to every device. Broadcasts never report per-device failure.
    fn broadcast_envelope(&self, envelope: Envelope) -> bool;
}

/// An application message surfaced by the mesh node.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Sending device, when the carrying connection was identity-bound.
    pub from: Option<String>,
    /// Carrying connection; `None` for loopback.
    pub connection_id: Option<String>,
    pub namespace: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub timestamp: Option<i64>,
}

type Handler = Arc<dyn Fn(&IncomingMessage) -> weft_core::Result<()> + Send + Sync>;

/// Namespace-keyed pub/sub atop the mesh node.
///
/// Dispatch is synchronous and sequential; the handler list is snapshotted
/// before dispatch so a handler may subscribe or unsubscribe reentrantly. A
/// failing handler is caught and surfaced as an event; the rest still run.
pub struct MessageBus {
    node: Weak<dyn EnvelopeSender>,
    subscriptions: Mutex<HashMap<String, Vec<(u64, Handler)>>>,
    next_id: AtomicU64,
    events: EventBus,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl MessageBus {
    pub fn new(node: Weak<dyn EnvelopeSender>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            node,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            pump: Mutex::new(None),
        })
    }

    /// Begin draining the node's incoming application messages.
    pub fn start(self: &Arc<Self>, mut incoming: broadcast::Receiver<IncomingMessage>) {
        let bus = Arc::clone(self);
        let task = tokio::spawn(async move {
            loop {
                match incoming.recv().await {
                    Ok(message) => bus.dispatch(&message),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "message bus lagged, dropped messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(old) = self.pump.lock().replace(task) {
            old.abort();
        }
    }

    pub fn stop(&self) {
        if let Some(task) = self.pump.lock().take() {
            task.abort();
        }
    }

    /// Register a handler for one namespace. The returned guard is the
    /// disposer: dropping it (or calling [`Subscription::dispose`])
    /// unregisters the handler; the last disposer of a namespace removes the
    /// entry entirely.
    pub fn subscribe<F>(self: &Arc<Self>, namespace: impl Into<String>, handler: F) -> Subscription
    where
        F: Fn(&IncomingMessage) -> weft_core::Result<()> + Send + Sync + 'static,
    {
        let namespace = namespace.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .entry(namespace.clone())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            bus: Arc::downgrade(self),
            namespace,
            id,
        }
    }

    /// Send one application message to a device. Returns the node's verdict,
    /// or `false` once the node is gone.
    pub fn publish(
        &self,
        target_device_id: &str,
        namespace: &str,
        kind: &str,
        payload: serde_json::Value,
    ) -> bool {
        let Some(node) = self.node.upgrade() else {
            return false;
        };
        node.send_envelope(target_device_id, Envelope::new(namespace, kind, payload))
    }

    /// Send one application message to every device.
    pub fn broadcast(&self, namespace: &str, kind: &str, payload: serde_json::Value) -> bool {
        let Some(node) = self.node.upgrade() else {
            return false;
        };
        node.broadcast_envelope(Envelope::new(namespace, kind, payload))
    }

    pub fn local_device_id(&self) -> Option<String> {
        self.node.upgrade().map(|n| n.local_device_id())
    }

    /// Deliver one incoming message to the namespace's handlers.
    pub fn dispatch(&self, message: &IncomingMessage) {
        let handlers: Vec<Handler> = {
            let subscriptions = self.subscriptions.lock();
            match subscriptions.get(&message.namespace) {
                Some(entries) => entries.iter().map(|(_, h)| Arc::clone(h)).collect(),
                None => return,
            }
        };
        for handler in handlers {
            if let Err(e) = handler(message) {
                warn!(namespace = %message.namespace, error = %e, "subscriber failed");
                self.events.publish(MeshEvent::SubscriberError {
                    namespace: message.namespace.clone(),
                    error: e.to_string(),
                });
            }
        }
    }

    fn unsubscribe(&self, namespace: &str, id: u64) {
        let removed_namespace = {
            let mut subscriptions = self.subscriptions.lock();
            let Some(entries) = subscriptions.get_mut(namespace) else {
                return;
            };
            entries.retain(|(entry_id, _)| *entry_id != id);
            if entries.is_empty() {
                subscriptions.remove(namespace);
                true
            } else {
                false
            }
        };
        if removed_namespace {
            debug!(namespace, "last subscriber gone");
            self.events.publish(MeshEvent::NamespaceUnsubscribed {
                namespace: namespace.to_string(),
            });
        }
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self, namespace: &str) -> usize {
        self.subscriptions
            .lock()
            .get(namespace)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

/// RAII disposer for one subscription.
pub struct Subscription {
    bus: Weak<MessageBus>,
    namespace: String,
    id: u64,
}

impl Subscription {
    /// Unsubscribe now instead of at drop.
    pub fn dispose(self) {}

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(&self.namespace, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct RecordingSender {
        sent: Mutex<Vec<(String, Envelope)>>,
        broadcasts: Mutex<Vec<Envelope>>,
    }

    impl RecordingSender {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                broadcasts: Mutex::new(Vec::new()),
            })
        }
    }

    impl EnvelopeSender for RecordingSender {
        fn local_device_id(&self) -> String {
            "dev-local".into()
        }
        fn send_envelope(&self, target: &str, envelope: Envelope) -> bool {
            self.sent.lock().push((target.to_string(), envelope));
            true
        }
        fn broadcast_envelope(&self, envelope: Envelope) -> bool {
            self.broadcasts.lock().push(envelope);
            true
        }
    }

    fn message(ns: &str) -> IncomingMessage {
        IncomingMessage {
            from: Some("dev-b".into()),
            connection_id: Some("incoming:c1".into()),
            namespace: ns.into(),
            kind: "x".into(),
            payload: serde_json::json!({"v": 1}),
            timestamp: Some(1),
        }
    }

    #[tokio::test]
    async fn subscribe_then_dispose_is_a_noop_on_the_registry() {
        let sender = RecordingSender::new();
        let bus = MessageBus::new(
            Arc::downgrade(&(sender as Arc<dyn EnvelopeSender>)),
            EventBus::default(),
        );
        let sub = bus.subscribe("events", |_| Ok(()));
        assert_eq!(bus.handler_count("events"), 1);
        sub.dispose();
        assert_eq!(bus.handler_count("events"), 0);
    }

    #[tokio::test]
    async fn failing_handler_does_not_block_the_rest() {
        let sender = RecordingSender::new();
        let events = EventBus::default();
        let mut events_rx = events.subscribe();
        let bus = MessageBus::new(
            Arc::downgrade(&(sender as Arc<dyn EnvelopeSender>)),
            events,
        );

        let calls = Arc::new(AtomicUsize::new(0));
        let _bad = bus.subscribe("events", |_| {
            Err(weft_core::WeftError::InvalidEnvelope("boom".into()))
        });
        let counted = Arc::clone(&calls);
        let _good = bus.subscribe("events", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&message("events"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        match events_rx.recv().await.unwrap() {
            MeshEvent::SubscriberError { namespace, error } => {
                assert_eq!(namespace, "events");
                assert!(error.contains("boom"));
            }
            other => panic!("expected SubscriberError, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn dispatch_only_hits_the_matching_namespace() {
        let sender = RecordingSender::new();
        let bus = MessageBus::new(
            Arc::downgrade(&(sender as Arc<dyn EnvelopeSender>)),
            EventBus::default(),
        );
        let hits = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&hits);
        let _sub = bus.subscribe("tasks", move |_| {
            counted.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.dispatch(&message("events"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        bus.dispatch(&message("tasks"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_and_broadcast_wrap_envelopes() {
        let sender = RecordingSender::new();
        let bus = MessageBus::new(
            Arc::downgrade(&(Arc::clone(&sender) as Arc<dyn EnvelopeSender>)),
            EventBus::default(),
        );

        assert!(bus.publish("dev-b", "events", "x", serde_json::json!({"v": 1})));
        assert!(bus.broadcast("events", "y", serde_json::json!({"v": 2})));

        let sent = sender.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "dev-b");
        assert_eq!(sent[0].1.namespace, "events");
        assert_eq!(sent[0].1.kind, "x");
        let broadcasts = sender.broadcasts.lock();
        assert_eq!(broadcasts.len(), 1);
        assert_eq!(broadcasts[0].kind, "y");
    }

    #[tokio::test]
    async fn publish_after_node_drop_returns_false() {
        let sender = RecordingSender::new();
        let weak = Arc::downgrade(&(Arc::clone(&sender) as Arc<dyn EnvelopeSender>));
        let bus = MessageBus::new(weak, EventBus::default());
        drop(sender);
        assert!(!bus.publish("dev-b", "events", "x", serde_json::json!({})));
    }
}
