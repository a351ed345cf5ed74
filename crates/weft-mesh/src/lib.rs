//! # weft-mesh
//!
//! The coordination layer: peer discovery by hostname convention, a shared
//! device table, election of exactly one primary with graceful failover, and
//! message routing that forms a logical star over the physical mesh.
//!
//! The [`node::MeshNode`] is the composition root — it owns the transport
//! and the table, consumes the overlay's events, and exposes raw
//! send/broadcast to the [`bus::MessageBus`] above it.

pub mod bus;
pub mod election;
pub mod node;
pub mod table;

pub use bus::{EnvelopeSender, IncomingMessage, MessageBus, Subscription};
pub use election::{
    ElectionConfig, ElectionCoordinator, ElectionEffect, ElectionPhase, rank_candidates,
};
pub use node::{MeshNode, NodeConfig};
pub use table::{DeviceTable, TableEvent};
