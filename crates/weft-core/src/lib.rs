//! # weft-core
//!
//! Core types, errors, and events for the weft device mesh.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: the device model, the wire envelope, the control-plane message
//! set, and the lifecycle event bus.

pub mod device;
pub mod envelope;
pub mod error;
pub mod event;
pub mod message;

pub use device::{Device, DeviceRole, DeviceStatus, format_hostname, parse_hostname};
pub use envelope::{Envelope, MESH_NAMESPACE};
pub use error::{Result, WeftError};
pub use event::{EventBus, MeshEvent};
pub use message::{Candidate, MeshMessage, MeshPayload, RouteBroadcast, RouteMessage};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
