//! # weft-overlay
//!
//! Client for the overlay sidecar: a child process that joins the encrypted
//! tailnet, owns the on-disk state directory, and exposes dial/listen/peers
//! over a line-delimited JSON IPC channel on stdin/stdout.
//!
//! The mesh treats the overlay as an external collaborator — this crate only
//! spawns it, speaks its protocol, and relays its events.

pub mod client;
pub mod protocol;

pub use client::{OverlayClient, OverlayConfig, OverlayHandle};
pub use protocol::{
    DialData, SidecarCommand, SidecarEvent, SidecarState, StartData, StatusData, TailnetPeer,
};
