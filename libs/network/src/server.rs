//! Link servers
//!
//! TCP and Unix listeners that turn every accepted connection into a
//! [`Link`] attached to a [`Switch`]. Connections that fail the handshake are
//! dropped. The number of live connections is observable through
//! [`ConnectionTracker`].

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mesh_codec::DEFAULT_MAX_FRAME_SIZE;
use mesh_types::Cost;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::link::Link;
use crate::switch::Switch;
use crate::transports::FramedStream;
use crate::{costs, Result, TransportError, DEFAULT_HANDSHAKE_TIMEOUT};

/// Options shared by all listeners
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Cost of accepted links; transport default when `None`
    pub cost: Option<Cost>,
    /// Secret peers must present; any peer is accepted when `None`
    pub auth: Option<String>,
    pub max_frame_size: usize,
    pub handshake_timeout: Duration,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            cost: None,
            auth: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

/// Live connection count with change notification
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    count: AtomicUsize,
    changed: Notify,
}

impl ConnectionTracker {
    pub fn connection_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Resolves on the next change to the connection count
    pub async fn wait_connections_changed(&self) -> usize {
        self.changed.notified().await;
        self.connection_count()
    }

    /// Resolves once the count satisfies `condition`
    pub async fn wait_for(&self, condition: impl Fn(usize) -> bool) -> usize {
        loop {
            let notified = self.changed.notified();
            let count = self.connection_count();
            if condition(count) {
                return count;
            }
            notified.await;
        }
    }

    fn opened(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    fn closed(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
    }
}

async fn serve_connection(
    mut framed: FramedStream,
    switch: Switch,
    options: Arc<ServerOptions>,
    cost: Cost,
    tracker: Arc<ConnectionTracker>,
) {
    let peer = framed.info().clone();
    if let Err(e) = framed
        .server_handshake(options.auth.as_deref(), options.handshake_timeout)
        .await
    {
        warn!(peer = %peer, error = %e, "Handshake failed");
        return;
    }

    let link = match Link::new(framed.into_transport(), cost) {
        Ok(link) => Arc::new(link),
        Err(e) => {
            warn!(peer = %peer, error = %e, "Rejected connection");
            return;
        }
    };

    if let Err(e) = switch.add_link(Arc::clone(&link)).await {
        warn!(peer = %peer, error = %e, "Could not attach link");
        link.close();
        return;
    }

    info!(link = link.id(), peer = %peer, "Accepted connection");
    tracker.opened();
    link.closed().await;
    tracker.closed();
    debug!(link = link.id(), peer = %peer, "Connection closed");
}

fn resolve_cost(options: &ServerOptions, default: Cost) -> Result<Cost> {
    match options.cost {
        Some(0) => Err(TransportError::configuration(
            "listener cost must be nonzero",
            Some("cost"),
        )),
        Some(cost) => Ok(cost),
        None => Ok(default),
    }
}

/// Accepts TCP connections into a switch
pub struct TcpLinkServer {
    listener: TcpListener,
    switch: Switch,
    options: Arc<ServerOptions>,
    cost: Cost,
    tracker: Arc<ConnectionTracker>,
}

impl TcpLinkServer {
    pub async fn bind(address: &str, switch: Switch, options: ServerOptions) -> Result<Self> {
        let cost = resolve_cost(&options, costs::TCP)?;
        let listener = TcpListener::bind(address).await.map_err(|e| {
            TransportError::connection_with_source("Failed to bind", Some(address.to_string()), e)
        })?;
        info!(address = %listener.local_addr()?, cost, "🚀 TCP link server listening");
        Ok(Self {
            listener,
            switch,
            options: Arc::new(options),
            cost,
            tracker: Arc::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn connections(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept connections until the task is cancelled
    pub async fn run(self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let framed = FramedStream::from_tcp(stream, self.options.max_frame_size);
            tokio::spawn(serve_connection(
                framed,
                self.switch.clone(),
                Arc::clone(&self.options),
                self.cost,
                Arc::clone(&self.tracker),
            ));
        }
    }
}

/// Accepts Unix socket connections into a switch
pub struct UnixLinkServer {
    listener: UnixListener,
    path: PathBuf,
    switch: Switch,
    options: Arc<ServerOptions>,
    cost: Cost,
    tracker: Arc<ConnectionTracker>,
}

impl UnixLinkServer {
    /// Bind at `path`, replacing a stale socket file
    pub async fn bind(path: impl AsRef<Path>, switch: Switch, options: ServerOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let cost = resolve_cost(&options, costs::UNIX)?;

        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| TransportError::io("Failed to remove stale socket", e))?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| {
            TransportError::connection_with_source(
                "Failed to bind",
                Some(path.display().to_string()),
                e,
            )
        })?;

        info!(path = %path.display(), cost, "🚀 Unix link server listening");
        Ok(Self {
            listener,
            path,
            switch,
            options: Arc::new(options),
            cost,
            tracker: Arc::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn connections(&self) -> Arc<ConnectionTracker> {
        Arc::clone(&self.tracker)
    }

    /// Accept connections until the task is cancelled
    pub async fn run(self) -> Result<()> {
        let label = self.path.display().to_string();
        loop {
            let stream = match self.listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };

            let framed = FramedStream::from_unix(stream, label.clone(), self.options.max_frame_size);
            tokio::spawn(serve_connection(
                framed,
                self.switch.clone(),
                Arc::clone(&self.options),
                self.cost,
                Arc::clone(&self.tracker),
            ));
        }
    }
}

impl Drop for UnixLinkServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
