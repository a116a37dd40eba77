//! # Mesh Node Configuration
//!
//! Loads a [`NodeConfig`] from a TOML file with `MESH_`-prefixed environment
//! overrides and provides the defaults shared by mesh services.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mesh_config::NodeConfig;
//! use std::path::Path;
//!
//! let config = NodeConfig::load(Some(Path::new("config/node.toml")))?;
//! for listener in &config.listeners {
//!     println!("{} {}", listener.kind, listener.address);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod defaults;
pub mod node_config;

pub use node_config::{
    ConnectionConfig, HandshakeConfig, ListenerConfig, NodeConfig, NodeSettings, TransportKind,
};
