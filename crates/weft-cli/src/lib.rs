//! # weft-cli
//!
//! The `weft` command: scaffold a config (`init`), run a node in the
//! foreground (`dev`), and inspect the configuration (`status`).

pub mod commands;

pub use commands::Cli;
