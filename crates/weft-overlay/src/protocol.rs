//! The sidecar IPC vocabulary: commands written to the child's stdin and
//! events read from its stdout, one JSON object per line.

use serde::{Deserialize, Serialize};

/// Lifecycle state reported by the sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SidecarState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

/// A command sent to the sidecar, serialized as `{"command": .., "data": ..}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "command", content = "data")]
pub enum SidecarCommand {
    #[serde(rename = "tsnet:start")]
    Start(StartData),
    #[serde(rename = "tsnet:stop")]
    Stop,
    #[serde(rename = "tsnet:status")]
    Status,
    #[serde(rename = "tsnet:getPeers")]
    GetPeers,
    #[serde(rename = "tsnet:wsMessage")]
    WsMessage {
        #[serde(rename = "connectionId")]
        connection_id: String,
        data: String,
    },
    #[serde(rename = "tsnet:dial")]
    Dial(DialData),
    #[serde(rename = "tsnet:dialClose")]
    DialClose {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
    #[serde(rename = "tsnet:dialMessage")]
    DialMessage {
        #[serde(rename = "deviceId")]
        device_id: String,
        data: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartData {
    pub hostname: String,
    pub state_dir: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub static_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname_prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialData {
    pub device_id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_name: Option<String>,
    pub port: u16,
}

/// An event received from the sidecar, parsed from `{"event": .., "data": ..}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SidecarEvent {
    #[serde(rename = "tsnet:status")]
    Status(StatusData),
    #[serde(rename = "tsnet:authRequired")]
    AuthRequired {
        #[serde(rename = "authUrl")]
        auth_url: String,
    },
    #[serde(rename = "tsnet:peers")]
    Peers { peers: Vec<TailnetPeer> },
    #[serde(rename = "tsnet:wsConnect")]
    WsConnect {
        #[serde(rename = "connectionId")]
        connection_id: String,
        #[serde(rename = "remoteAddr")]
        remote_addr: String,
    },
    #[serde(rename = "tsnet:wsMessage")]
    WsMessage {
        #[serde(rename = "connectionId")]
        connection_id: String,
        data: String,
    },
    #[serde(rename = "tsnet:wsDisconnect")]
    WsDisconnect {
        #[serde(rename = "connectionId")]
        connection_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "tsnet:dialConnected")]
    DialConnected {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "remoteAddr")]
        remote_addr: String,
    },
    #[serde(rename = "tsnet:dialMessage")]
    DialMessage {
        #[serde(rename = "deviceId")]
        device_id: String,
        data: String,
    },
    #[serde(rename = "tsnet:dialDisconnect")]
    DialDisconnect {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    #[serde(rename = "tsnet:dialError")]
    DialError {
        #[serde(rename = "deviceId")]
        device_id: String,
        error: String,
    },
    #[serde(rename = "tsnet:error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        message: String,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub state: Option<SidecarState>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// One peer on the tailnet, as reported by `tsnet:peers`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TailnetPeer {
    pub id: String,
    pub hostname: String,
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(rename = "tailscaleIPs", default)]
    pub tailscale_ips: Vec<String>,
    pub online: bool,
    #[serde(default)]
    pub os: Option<String>,
}
