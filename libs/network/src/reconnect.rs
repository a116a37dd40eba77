//! Auto-reconnecting outbound connections
//!
//! An [`AutoReconnector`] keeps one outbound link attached to a switch:
//! connect, attach, wait for the link to close, sleep, repeat. It stops only
//! when the switch stops.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::link::Link;
use crate::switch::Switch;
use crate::transports::{connect_tcp, connect_unix, ConnectOptions};
use crate::{Result, TransportError};

type ConnectFn = Box<dyn Fn() -> BoxFuture<'static, Result<Arc<Link>>> + Send + Sync>;

/// Keeps an outbound link attached to a switch
pub struct AutoReconnector {
    name: String,
    switch: Switch,
    connect: ConnectFn,
    delay: Duration,
    connected: watch::Sender<bool>,
}

impl AutoReconnector {
    pub fn new<F, Fut>(name: impl Into<String>, switch: Switch, delay: Duration, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<Link>>> + Send + 'static,
    {
        let (connected, _) = watch::channel(false);
        Self {
            name: name.into(),
            switch,
            connect: Box::new(move || connect().boxed()),
            delay,
            connected,
        }
    }

    pub fn tcp(switch: Switch, address: String, options: ConnectOptions, delay: Duration) -> Self {
        let name = format!("tcp://{address}");
        Self::new(name, switch, delay, move || {
            let address = address.clone();
            let options = options.clone();
            async move { connect_tcp(&address, &options).await }
        })
    }

    pub fn unix(switch: Switch, path: PathBuf, options: ConnectOptions, delay: Duration) -> Self {
        let name = format!("unix://{}", path.display());
        Self::new(name, switch, delay, move || {
            let path = path.clone();
            let options = options.clone();
            async move { connect_unix(&path, &options).await }
        })
    }

    /// Observe whether a link is currently attached
    pub fn status(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    /// Run until the switch stops
    pub async fn run(self) {
        loop {
            match (self.connect)().await {
                Ok(link) => match self.switch.add_link(Arc::clone(&link)).await {
                    Ok(()) => {
                        info!(peer = %self.name, link = link.id(), "Connected");
                        self.connected.send_replace(true);
                        link.closed().await;
                        self.connected.send_replace(false);
                        warn!(peer = %self.name, link = link.id(), "Connection lost");
                    }
                    Err(TransportError::SwitchStopped) => {
                        link.close();
                        return;
                    }
                    Err(e) => {
                        link.close();
                        warn!(peer = %self.name, error = %e, "Failed to attach link");
                    }
                },
                Err(e) => warn!(peer = %self.name, error = %e, "Connection attempt failed"),
            }

            if !self.switch.is_running() {
                return;
            }
            tokio::time::sleep(self.delay).await;
        }
    }
}
