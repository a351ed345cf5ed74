use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use weft_codec::FrameDecoder;

/// Reason string attached when the transport itself is shut down; close
/// events carrying it never schedule a reconnect.
pub const REASON_SERVICE_STOPPED: &str = "service_stopped";
pub const REASON_HEARTBEAT_TIMEOUT: &str = "heartbeat_timeout";
pub const REASON_SEND_BUFFER_FULL: &str = "send_buffer_full";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Connection id for an accepted stream: `incoming:<sidecar-id>`.
pub fn incoming_id(sidecar_id: &str) -> String {
    format!("incoming:{sidecar_id}")
}

/// Connection id for an outgoing stream: `dial:<deviceId>`.
pub fn outgoing_id(device_id: &str) -> String {
    format!("dial:{device_id}")
}

/// Reconnect backoff: `min(1000 * 2^(n-1), cap)` for attempt `n >= 1`.
pub fn reconnect_delay(attempt: u32, cap: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = Duration::from_millis(1000u64 << exp);
    delay.min(cap)
}

/// Public snapshot of one connection row.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: String,
    pub device_id: Option<String>,
    pub direction: ConnectionDirection,
    pub remote_addr: String,
    pub status: ConnectionStatus,
    /// Milliseconds since the Unix epoch, set when the stream became usable.
    pub connected_at: Option<i64>,
    pub last_activity_at: i64,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// One live stream owned by the transport.
pub(crate) struct ConnectionRow {
    pub info: ConnectionInfo,
    /// Raw sidecar connection id, present for incoming rows (needed to
    /// address `tsnet:wsMessage`).
    pub sidecar_id: Option<String>,
    pub decoder: FrameDecoder,
    pub last_activity: Instant,
    pub heartbeat: Option<JoinHandle<()>>,
}

impl ConnectionRow {
    pub fn snapshot(&self) -> ConnectionInfo {
        self.info.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_follow_the_naming_scheme() {
        assert_eq!(incoming_id("c42"), "incoming:c42");
        assert_eq!(outgoing_id("dev-b"), "dial:dev-b");
    }

    #[test]
    fn reconnect_delay_doubles_then_caps() {
        let cap = Duration::from_millis(30_000);
        assert_eq!(reconnect_delay(1, cap), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(2, cap), Duration::from_millis(2000));
        assert_eq!(reconnect_delay(3, cap), Duration::from_millis(4000));
        assert_eq!(reconnect_delay(5, cap), Duration::from_millis(16_000));
        assert_eq!(reconnect_delay(6, cap), Duration::from_millis(30_000));
        assert_eq!(reconnect_delay(60, cap), Duration::from_millis(30_000));
    }
}
