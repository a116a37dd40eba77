//! Node Configuration Module
//!
//! Describes what a mesh node listens on and connects to. Loaded from a TOML
//! file, then overridden by `MESH_`-prefixed environment variables using
//! `__` as the nesting separator (`MESH_NODE__LOG_LEVEL=debug`).

use anyhow::{bail, Context, Result};
use config_crate::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::defaults;

/// Complete node configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    pub node: NodeSettings,

    /// Inbound listeners
    pub listeners: Vec<ListenerConfig>,

    /// Outbound connections kept alive by the node
    pub connections: Vec<ConnectionConfig>,

    pub handshake: HandshakeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct NodeSettings {
    pub name: String,
    pub log_level: String,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            name: defaults::node::NAME.to_string(),
            log_level: defaults::node::LOG_LEVEL.to_string(),
        }
    }
}

/// Stream transport of a listener or connection
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Unix,
}

impl TransportKind {
    /// Link cost used when none is configured
    pub fn default_cost(self) -> u32 {
        match self {
            Self::Tcp => defaults::costs::TCP,
            Self::Unix => defaults::costs::UNIX,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Unix => write!(f, "unix"),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ListenerConfig {
    pub kind: TransportKind,
    /// `host:port` for TCP, socket path for Unix
    pub address: String,
    pub cost: Option<u32>,
}

impl ListenerConfig {
    pub fn effective_cost(&self) -> u32 {
        self.cost.unwrap_or_else(|| self.kind.default_cost())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    pub kind: TransportKind,
    pub address: String,
    pub cost: Option<u32>,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_reconnect_delay_ms() -> u64 {
    defaults::connections::RECONNECT_DELAY_MS
}

impl ConnectionConfig {
    pub fn effective_cost(&self) -> u32 {
        self.cost.unwrap_or_else(|| self.kind.default_cost())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// Connection handshake settings
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct HandshakeConfig {
    /// Shared secret; when set, peers must present it and outbound
    /// connections send it
    pub auth: Option<String>,
    pub timeout_ms: u64,
    pub max_frame_size: usize,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            auth: None,
            timeout_ms: defaults::connections::HANDSHAKE_TIMEOUT_MS,
            max_frame_size: defaults::node::MAX_FRAME_SIZE,
        }
    }
}

impl HandshakeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl NodeConfig {
    /// Load from `path` (if given) with environment overrides, then expand
    /// `$VARS` in addresses and validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            info!("Loading node config: {:?}", path);
            builder = builder.add_source(File::from(path).required(true));
        }
        let config = builder
            .add_source(
                Environment::with_prefix(defaults::node::ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        Self::finish(config)
    }

    /// Parse TOML text, without environment overrides
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .context("Failed to parse configuration")?;
        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self> {
        let mut node: NodeConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        node.expand_env_vars()?;
        node.validate()?;
        debug!(
            listeners = node.listeners.len(),
            connections = node.connections.len(),
            "Node config loaded"
        );
        Ok(node)
    }

    /// Expand environment variables in addresses
    pub fn expand_env_vars(&mut self) -> Result<()> {
        for listener in &mut self.listeners {
            listener.address = shellexpand::env(&listener.address)
                .context("Failed to expand listener address")?
                .into_owned();
        }
        for connection in &mut self.connections {
            connection.address = shellexpand::env(&connection.address)
                .context("Failed to expand connection address")?
                .into_owned();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        for listener in &self.listeners {
            if listener.address.is_empty() {
                bail!("{} listener has an empty address", listener.kind);
            }
            if listener.cost == Some(0) {
                bail!("listener {} has cost 0; costs must be positive", listener.address);
            }
        }
        for connection in &self.connections {
            if connection.address.is_empty() {
                bail!("{} connection has an empty address", connection.kind);
            }
            if connection.cost == Some(0) {
                bail!("connection {} has cost 0; costs must be positive", connection.address);
            }
        }
        if self.handshake.max_frame_size == 0 {
            bail!("handshake.max_frame_size must be positive");
        }
        Ok(())
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
