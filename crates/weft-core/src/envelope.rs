use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};

/// Reserved namespace carrying control-plane traffic. Everything else is
/// application traffic.
pub const MESH_NAMESPACE: &str = "mesh";

/// Envelope types on the mesh namespace.
pub mod mesh_kind {
    /// Wraps a [`crate::MeshMessage`].
    pub const MESSAGE: &str = "message";
    /// Primary-routed directed traffic, payload [`crate::RouteMessage`].
    pub const ROUTE_MESSAGE: &str = "route:message";
    /// Primary-routed fan-out traffic, payload [`crate::RouteBroadcast`].
    pub const ROUTE_BROADCAST: &str = "route:broadcast";
    /// Heartbeat probe, intercepted by the transport.
    pub const PING: &str = "ping";
    /// Heartbeat answer, intercepted by the transport.
    pub const PONG: &str = "pong";
}

/// The `{namespace, type, payload}` unit transmitted per frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub namespace: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Envelope {
    pub fn new(
        namespace: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            kind: kind.into(),
            payload,
            timestamp: Some(crate::now_ms()),
        }
    }

    pub fn is_control(&self) -> bool {
        self.namespace == MESH_NAMESPACE
    }

    /// Reject envelopes with an empty namespace or type.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(WeftError::InvalidEnvelope("empty namespace".into()));
        }
        if self.kind.is_empty() {
            return Err(WeftError::InvalidEnvelope("empty type".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_empty_fields() {
        let mut env = Envelope::new("events", "x", serde_json::json!({"v": 1}));
        assert!(env.validate().is_ok());
        env.namespace.clear();
        assert!(matches!(env.validate(), Err(WeftError::InvalidEnvelope(_))));
        env.namespace = "events".into();
        env.kind.clear();
        assert!(matches!(env.validate(), Err(WeftError::InvalidEnvelope(_))));
    }

    #[test]
    fn timestamp_is_optional_on_the_wire() {
        let env = Envelope {
            namespace: "events".into(),
            kind: "x".into(),
            payload: serde_json::Value::Null,
            timestamp: None,
        };
        let v = serde_json::to_value(&env).unwrap();
        assert!(v.get("timestamp").is_none());
        let back: Envelope = serde_json::from_value(v).unwrap();
        assert_eq!(back, env);
    }
}
