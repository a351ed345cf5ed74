//! # weft-config
//!
//! `weft.toml` schema and loader: node identity, sidecar launch settings,
//! mesh timings, and logging, with env overrides and hot reload.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, LoggingSection, MeshSection, NodeSection, SidecarSection, WarningSeverity,
    WeftConfig,
};
