//! # Mesh Node
//!
//! Runs one [`Switch`] with the listeners and outbound connections described
//! by a [`NodeConfig`]. Accepted and outbound links all attach to the same
//! switch, so the node forwards traffic between every peer it knows.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use mesh_config::{ConnectionConfig, HandshakeConfig, NodeConfig, TransportKind};
use mesh_network::{
    AutoReconnector, ConnectOptions, ServerOptions, Switch, TcpLinkServer, UnixLinkServer,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global subscriber; `RUST_LOG` takes precedence over `level`
pub fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

fn server_options(cost: u32, handshake: &HandshakeConfig) -> ServerOptions {
    ServerOptions {
        cost: Some(cost),
        auth: handshake.auth.clone(),
        max_frame_size: handshake.max_frame_size,
        handshake_timeout: handshake.timeout(),
    }
}

fn connect_options(connection: &ConnectionConfig, handshake: &HandshakeConfig) -> ConnectOptions {
    ConnectOptions {
        cost: Some(connection.effective_cost()),
        auth: handshake.auth.clone(),
        max_frame_size: handshake.max_frame_size,
        handshake_timeout: handshake.timeout(),
    }
}

/// A running node
pub struct Node {
    switch: Switch,
    tcp_addresses: Vec<SocketAddr>,
    unix_paths: Vec<PathBuf>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind every listener and start every outbound connection
    pub async fn start(config: &NodeConfig) -> Result<Self> {
        let switch = Switch::new();
        let mut node = Self {
            switch: switch.clone(),
            tcp_addresses: Vec::new(),
            unix_paths: Vec::new(),
            tasks: Vec::new(),
        };

        for listener in &config.listeners {
            let options = server_options(listener.effective_cost(), &config.handshake);
            match listener.kind {
                TransportKind::Tcp => {
                    let server = TcpLinkServer::bind(&listener.address, switch.clone(), options)
                        .await
                        .with_context(|| format!("Failed to listen on {}", listener.address))?;
                    node.tcp_addresses.push(server.local_addr()?);
                    node.tasks.push(tokio::spawn(async move {
                        if let Err(e) = server.run().await {
                            warn!(error = %e, "TCP link server stopped");
                        }
                    }));
                }
                TransportKind::Unix => {
                    let server = UnixLinkServer::bind(&listener.address, switch.clone(), options)
                        .await
                        .with_context(|| format!("Failed to listen on {}", listener.address))?;
                    node.unix_paths.push(server.path().to_path_buf());
                    node.tasks.push(tokio::spawn(async move {
                        if let Err(e) = server.run().await {
                            warn!(error = %e, "Unix link server stopped");
                        }
                    }));
                }
            }
        }

        for connection in &config.connections {
            let options = connect_options(connection, &config.handshake);
            let reconnector = match connection.kind {
                TransportKind::Tcp => AutoReconnector::tcp(
                    switch.clone(),
                    connection.address.clone(),
                    options,
                    connection.reconnect_delay(),
                ),
                TransportKind::Unix => AutoReconnector::unix(
                    switch.clone(),
                    PathBuf::from(&connection.address),
                    options,
                    connection.reconnect_delay(),
                ),
            };
            node.tasks.push(tokio::spawn(reconnector.run()));
        }

        info!(
            name = %config.node.name,
            listeners = config.listeners.len(),
            connections = config.connections.len(),
            "Node started"
        );
        Ok(node)
    }

    pub fn switch(&self) -> &Switch {
        &self.switch
    }

    /// Bound TCP listener addresses, in configuration order
    pub fn tcp_addresses(&self) -> &[SocketAddr] {
        &self.tcp_addresses
    }

    pub fn unix_paths(&self) -> &[PathBuf] {
        &self.unix_paths
    }

    /// Stop listeners and reconnectors, then close every link
    pub async fn shutdown(self) -> Result<()> {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        self.switch.shutdown().await?;
        info!("Node stopped");
        Ok(())
    }
}
