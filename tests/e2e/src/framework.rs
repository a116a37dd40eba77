//! Scenario harness
//!
//! A [`MeshHarness`] owns a set of named switches and the sockets, servers
//! and background tasks that connect them. Scenarios build a topology on it,
//! drive clients and report what they observed.

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mesh_client::Client;
use mesh_network::{
    connect_tcp, connect_unix, ConnectOptions, Link, QueueTransport, ServerOptions, Switch,
    SwitchSnapshot, TcpLinkServer, TopicRemapTransport, UnixLinkServer,
};
use mesh_types::{Cost, TopicId};
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Named switches plus the servers and tasks connecting them
pub struct MeshHarness {
    switches: BTreeMap<String, Switch>,
    tasks: Vec<JoinHandle<()>>,
    socket_dir: TempDir,
    wait: Duration,
}

impl MeshHarness {
    pub fn new(wait: Duration) -> Result<Self> {
        Ok(Self {
            switches: BTreeMap::new(),
            tasks: Vec::new(),
            socket_dir: tempfile::tempdir().context("Failed to create socket directory")?,
            wait,
        })
    }

    /// The switch called `name`, started on first use
    pub fn switch(&mut self, name: &str) -> Switch {
        self.switches
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(switch = name, "Starting switch");
                Switch::new()
            })
            .clone()
    }

    /// A client attached to switch `name` through an in-process link
    pub async fn client(&mut self, name: &str) -> Result<Client> {
        let switch = self.switch(name);
        Client::connect(&switch)
            .await
            .with_context(|| format!("Failed to attach client to {name}"))
    }

    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.path().join(format!("{name}.sock"))
    }

    /// Keep `task` running until the harness shuts down
    pub fn spawn(&mut self, task: impl Future<Output = ()> + Send + 'static) {
        self.tasks.push(tokio::spawn(task));
    }

    /// Connect two switches with a serialized in-process link.
    ///
    /// Returns the link ends attached to `a` and `b`.
    pub async fn link_queue(
        &mut self,
        a: &str,
        b: &str,
        cost: Cost,
    ) -> Result<(Arc<Link>, Arc<Link>)> {
        let (a_end, b_end) = QueueTransport::pair(true);
        self.attach_pair(a, b, Link::new(a_end, cost)?, Link::new(b_end, cost)?)
            .await
    }

    /// Connect switches whose link remaps topic ids on `a`'s side
    pub async fn link_remapped(
        &mut self,
        a: &str,
        b: &str,
        cost: Cost,
        mapping: Vec<(TopicId, TopicId)>,
    ) -> Result<(Arc<Link>, Arc<Link>)> {
        let (a_end, b_end) = QueueTransport::pair(true);
        let a_end = TopicRemapTransport::new(a_end, mapping);
        self.attach_pair(a, b, Link::new(a_end, cost)?, Link::new(b_end, cost)?)
            .await
    }

    async fn attach_pair(
        &mut self,
        a: &str,
        b: &str,
        a_link: Link,
        b_link: Link,
    ) -> Result<(Arc<Link>, Arc<Link>)> {
        let (a_link, b_link) = (Arc::new(a_link), Arc::new(b_link));
        self.switch(a).add_link(Arc::clone(&a_link)).await?;
        self.switch(b).add_link(Arc::clone(&b_link)).await?;
        info!(a, b, cost = a_link.cost(), "Linked switches in process");
        Ok((a_link, b_link))
    }

    /// Start a TCP listener on `server` and connect `client` to it.
    ///
    /// Returns the link end attached to `client`.
    pub async fn link_tcp(
        &mut self,
        server: &str,
        client: &str,
        cost: Cost,
        auth: Option<&str>,
    ) -> Result<Arc<Link>> {
        let listener = TcpLinkServer::bind(
            "127.0.0.1:0",
            self.switch(server),
            server_options(cost, auth),
        )
        .await?;
        let address = listener.local_addr()?.to_string();
        self.spawn(async move {
            if let Err(e) = listener.run().await {
                warn!(error = %e, "TCP listener stopped");
            }
        });

        let link = connect_tcp(&address, &connect_options(cost, auth)).await?;
        self.switch(client).add_link(Arc::clone(&link)).await?;
        info!(server, client, %address, cost, "Linked switches over TCP");
        Ok(link)
    }

    /// Start a Unix listener on `server` and connect `client` to it.
    ///
    /// Returns the link end attached to `client`.
    pub async fn link_unix(&mut self, server: &str, client: &str, cost: Cost) -> Result<Arc<Link>> {
        let path = self.socket_path(&format!("{server}-{client}"));
        let listener =
            UnixLinkServer::bind(&path, self.switch(server), server_options(cost, None)).await?;
        self.spawn(async move {
            if let Err(e) = listener.run().await {
                warn!(error = %e, "Unix listener stopped");
            }
        });

        let link = connect_unix(&path, &connect_options(cost, None)).await?;
        self.switch(client).add_link(Arc::clone(&link)).await?;
        info!(server, client, path = %path.display(), cost, "Linked switches over Unix socket");
        Ok(link)
    }

    /// Await `future`, failing the scenario after the harness wait time
    pub async fn within<T>(&self, what: &str, future: impl Future<Output = T>) -> Result<T> {
        tokio::time::timeout(self.wait, future)
            .await
            .with_context(|| format!("Timed out waiting for {what}"))
    }

    /// Poll `switch` until its snapshot satisfies `condition`
    pub async fn wait_for_snapshot(
        &self,
        switch: &Switch,
        what: &str,
        condition: impl Fn(&SwitchSnapshot) -> bool,
    ) -> Result<()> {
        self.within(what, async {
            loop {
                if condition(&switch.snapshot().await?) {
                    return Ok::<_, anyhow::Error>(());
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?
    }

    /// Stop all tasks and switches
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for (name, switch) in &self.switches {
            if let Err(e) = switch.shutdown().await {
                debug!(switch = %name, error = %e, "Switch already stopped");
            }
        }
    }
}

fn server_options(cost: Cost, auth: Option<&str>) -> ServerOptions {
    ServerOptions {
        cost: Some(cost),
        auth: auth.map(str::to_string),
        ..ServerOptions::default()
    }
}

fn connect_options(cost: Cost, auth: Option<&str>) -> ConnectOptions {
    ConnectOptions {
        cost: Some(cost),
        auth: auth.map(str::to_string),
        ..ConnectOptions::default()
    }
}

/// A named end-to-end scenario
#[async_trait::async_trait]
pub trait TestScenario: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// Upper bound for each individual wait inside the scenario
    fn timeout(&self) -> Duration {
        Duration::from_secs(5)
    }

    /// Build the topology and drive it; returns the number of payloads
    /// delivered end to end
    async fn execute(&self, mesh: &mut MeshHarness) -> Result<u64>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    pub scenario_name: String,
    pub success: bool,
    pub duration: Duration,
    pub messages_delivered: u64,
    pub error_message: Option<String>,
}

/// Run one scenario on a fresh harness
pub async fn run_scenario(scenario: &dyn TestScenario) -> TestResult {
    let started = Instant::now();
    info!(scenario = scenario.name(), "▶ {}", scenario.description());

    let outcome = match MeshHarness::new(scenario.timeout()) {
        Ok(mut mesh) => {
            let outcome = scenario.execute(&mut mesh).await;
            mesh.shutdown().await;
            outcome
        }
        Err(e) => Err(e),
    };

    let result = TestResult {
        scenario_name: scenario.name().to_string(),
        success: outcome.is_ok(),
        duration: started.elapsed(),
        messages_delivered: *outcome.as_ref().unwrap_or(&0),
        error_message: outcome.as_ref().err().map(|e| format!("{e:#}")),
    };
    match &result.error_message {
        None => info!(
            scenario = %result.scenario_name,
            delivered = result.messages_delivered,
            elapsed_ms = result.duration.as_millis() as u64,
            "✅ Scenario passed"
        ),
        Some(message) => error!(scenario = %result.scenario_name, error = %message, "❌ Scenario failed"),
    }
    result
}
