#![warn(missing_docs)]

//! snapvault management subsystem: job files, snapshot naming, tool discovery, remote gate, CLI

pub mod cli;
pub mod config;
pub mod discovery;
pub mod gate;
pub mod naming;

pub use config::{JobFile, SubvolumeDecl, ToolOverrides, VaultConfig};
pub use discovery::discover_tools;
pub use gate::{AllowList, GateRefusal, GateRequest};
pub use naming::{expand_env, SnapshotTemplate};
