use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Role a device plays in the logical star. At most one device in the mesh
/// holds `Primary` at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceRole {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Online,
    Offline,
    Connecting,
}

/// One participant in the mesh, uniquely identified by a stable `id`.
///
/// The `id` is immutable; the hostname is deterministic from
/// `{prefix}-{type}-{id}` (see [`format_hostname`]). Offline devices stay in
/// the table so they can be recognized on return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    /// Device kind, a single `-`-free label (e.g. `desktop`, `phone`).
    #[serde(rename = "type")]
    pub device_type: String,
    /// Mutable human label.
    pub name: String,
    /// Hostname on the overlay, `{prefix}-{type}-{id}`.
    pub hostname: String,
    /// Full MagicDNS name, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DeviceRole>,
    pub status: DeviceStatus,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub last_seen: i64,
    /// When the node process started, used for election ranking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
}

impl Device {
    /// Create a device with the derived hostname and no known address.
    pub fn new(
        id: impl Into<String>,
        device_type: impl Into<String>,
        name: impl Into<String>,
        prefix: &str,
    ) -> Self {
        let id = id.into();
        let device_type = device_type.into();
        let hostname = format_hostname(prefix, &device_type, &id);
        Self {
            id,
            device_type,
            name: name.into(),
            hostname,
            dns_name: None,
            ip: None,
            role: None,
            status: DeviceStatus::Offline,
            capabilities: Vec::new(),
            metadata: HashMap::new(),
            last_seen: crate::now_ms(),
            started_at: None,
            os: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == Some(DeviceRole::Primary)
    }
}

/// Build the overlay hostname for a device: `{prefix}-{type}-{id}`.
pub fn format_hostname(prefix: &str, device_type: &str, id: &str) -> String {
    format!("{prefix}-{device_type}-{id}")
}

/// Parse an overlay hostname back into `(type, id)`.
///
/// The convention is `{prefix}-{type}-{id}` where `type` contains no `-` and
/// `id` may contain any number of them. Hostnames that do not carry the
/// prefix, or that have no id segment, are not ours and yield `None`.
pub fn parse_hostname(prefix: &str, hostname: &str) -> Option<(String, String)> {
    let rest = hostname.strip_prefix(prefix)?.strip_prefix('-')?;
    let (device_type, id) = rest.split_once('-')?;
    if device_type.is_empty() || id.is_empty() {
        return None;
    }
    Some((device_type.to_string(), id.to_string()))
}
