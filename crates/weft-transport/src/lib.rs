//! # weft-transport
//!
//! The connection pool above the overlay: persistent, length-framed,
//! heartbeat-monitored bidirectional streams with identity binding and
//! auto-reconnect.
//!
//! Streams are named `incoming:<sidecar-id>` (accepted) and
//! `dial:<deviceId>` (outgoing). Frame bytes ride the sidecar IPC as base64
//! strings. A reconnect ledger, kept separate from the connection map,
//! drives capped exponential backoff for registered outgoing peers.

pub mod connection;
pub mod manager;

pub use connection::{
    ConnectionDirection, ConnectionInfo, ConnectionStatus, REASON_HEARTBEAT_TIMEOUT,
    REASON_SEND_BUFFER_FULL, REASON_SERVICE_STOPPED, incoming_id, outgoing_id, reconnect_delay,
};
pub use manager::{ConnectionManager, TransportConfig, TransportEvent};
