use serde::{Deserialize, Serialize};

use crate::device::Device;
use crate::envelope::{Envelope, MESH_NAMESPACE, mesh_kind};
use crate::error::{Result, WeftError};

/// A control-plane message, carried on the mesh namespace inside an envelope
/// of type `message`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshMessage {
    /// Sender device id.
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub timestamp: i64,
    #[serde(
        default,
        rename = "correlationId",
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
    #[serde(flatten)]
    pub payload: MeshPayload,
}

/// The closed set of control-plane message types. Unknown types fail
/// deserialization at the boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum MeshPayload {
    #[serde(rename = "device:announce")]
    DeviceAnnounce { device: Device },
    #[serde(rename = "device:update")]
    DeviceUpdate { device: Device },
    #[serde(rename = "device:goodbye")]
    DeviceGoodbye {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    #[serde(rename = "device:list")]
    DeviceList {
        devices: Vec<Device>,
        #[serde(rename = "primaryId")]
        primary_id: Option<String>,
    },
    #[serde(rename = "election:start")]
    ElectionStart {},
    #[serde(rename = "election:candidate")]
    ElectionCandidate { candidate: Candidate },
    /// Legacy, superseded by the candidate/result flow. Accepted and ignored.
    #[serde(rename = "election:vote")]
    ElectionVote {
        #[serde(rename = "candidateId")]
        candidate_id: String,
    },
    #[serde(rename = "election:result")]
    ElectionResult {
        #[serde(rename = "primaryId")]
        primary_id: String,
        reason: String,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

/// One entrant in an election round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub device_id: String,
    /// Milliseconds since the candidate's node process started.
    pub uptime: u64,
    pub user_designated: bool,
}

impl MeshMessage {
    pub fn new(from: impl Into<String>, payload: MeshPayload) -> Self {
        Self {
            from: from.into(),
            to: None,
            timestamp: crate::now_ms(),
            correlation_id: None,
            payload,
        }
    }

    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }

    /// Wrap this message in a `mesh`/`message` envelope.
    pub fn into_envelope(self) -> Result<Envelope> {
        Ok(Envelope::new(
            MESH_NAMESPACE,
            mesh_kind::MESSAGE,
            serde_json::to_value(self)?,
        ))
    }

    /// Extract a control-plane message from a `mesh`/`message` envelope.
    /// Malformed or unknown payloads are rejected at this boundary.
    pub fn from_envelope(env: &Envelope) -> Result<Self> {
        serde_json::from_value(env.payload.clone())
            .map_err(|e| WeftError::InvalidControlPayload(e.to_string()))
    }
}

/// Payload of a `mesh`/`route:message` envelope: a directed application
/// envelope a secondary asks the primary to forward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMessage {
    pub target_device_id: String,
    pub envelope: Envelope,
}

/// Payload of a `mesh`/`route:broadcast` envelope: an application envelope
/// the primary fans out to everyone except the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteBroadcast {
    pub envelope: Envelope,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn announce_roundtrip_keeps_wire_tag() {
        let device = Device::new("dev-1", "desktop", "box", "weft");
        let msg = MeshMessage::new("dev-1", MeshPayload::DeviceAnnounce { device });
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "device:announce");
        assert_eq!(v["payload"]["device"]["id"], "dev-1");
        let back = MeshMessage::from_envelope(&msg.clone().into_envelope().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn unknown_control_type_is_rejected() {
        let env = Envelope::new(
            MESH_NAMESPACE,
            mesh_kind::MESSAGE,
            serde_json::json!({
                "from": "dev-1",
                "timestamp": 0,
                "type": "device:selfdestruct",
                "payload": {}
            }),
        );
        assert!(matches!(
            MeshMessage::from_envelope(&env),
            Err(WeftError::InvalidControlPayload(_))
        ));
    }

    #[test]
    fn election_result_wire_shape() {
        let msg = MeshMessage::new(
            "dev-a",
            MeshPayload::ElectionResult {
                primary_id: "dev-a".into(),
                reason: "election".into(),
            },
        );
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "election:result");
        assert_eq!(v["payload"]["primaryId"], "dev-a");
    }
}
