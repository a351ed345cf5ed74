//! # weft-sync
//!
//! Best-effort state replication: each device owns one slice per application
//! store, broadcast on change, applied on receipt when the version advances,
//! and evicted on peer loss. Last writer wins per device-owned slice;
//! nothing here survives a restart.

pub mod adapter;
pub mod store;

pub use adapter::{StoreSyncAdapter, SYNC_NAMESPACE};
pub use store::{DeviceSlice, MemorySliceStore, SyncStore};
