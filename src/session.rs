//! Session façade composing discovery and command channels
//!
//! The only entry point consumers use: start a node, watch peers appear,
//! open command connections, run commands, stop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::core::{CommandResult, Config, Error, ExecMode, NodeId, NodeIdentity, Result};
use crate::network::channel::CommandChannel;
use crate::network::discovery::DiscoveryService;
use crate::network::registry::{NodeRegistry, RegistryEvent};
use crate::network::server::{CommandHandler, CommandServer};
use crate::util::RetryPolicy;

/// A running peerlink node: discovery, command serving, and outgoing
/// command connections under one lifecycle.
pub struct Session {
    identity: NodeIdentity,
    config: Config,
    registry: NodeRegistry,
    discovery: Option<DiscoveryService>,
    server: Option<CommandServer>,
    channels: Arc<Mutex<HashMap<NodeId, Arc<CommandChannel>>>>,
}

impl Session {
    /// Creates a stopped session for the given identity
    pub fn new(identity: NodeIdentity, config: Config) -> Self {
        Session {
            identity,
            config,
            registry: NodeRegistry::new(),
            discovery: None,
            server: None,
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Brings up the command server and discovery loops.
    ///
    /// Fails with `AlreadyStarted` if called again without `stop`; a bind
    /// failure on either socket is reported here and leaves the session
    /// stopped.
    pub async fn start(&mut self, handler: Arc<dyn CommandHandler>) -> Result<()> {
        if self.discovery.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let server = CommandServer::bind(self.identity.clone(), &self.config, handler).await?;
        let mut discovery = DiscoveryService::new(
            self.identity.clone(),
            self.config.clone(),
            self.registry.clone(),
        );
        if let Err(e) = discovery.start().await {
            server.shutdown();
            return Err(e);
        }

        self.server = Some(server);
        self.discovery = Some(discovery);
        info!(node = %self.identity.id, "session started");
        Ok(())
    }

    /// Returns whether the session is started
    pub fn is_running(&self) -> bool {
        self.discovery.is_some()
    }

    /// Returns a snapshot of the peers currently believed live
    pub fn discovered_nodes(&self) -> Vec<NodeIdentity> {
        self.registry.identities()
    }

    /// Subscribes to peer found/lost notifications
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Opens a command connection to a discovered peer.
    ///
    /// Looks the peer up first; an unknown id fails with `NotFound` without
    /// any connection attempt. Idempotent per peer: an existing open channel
    /// is returned as-is, a dead one is replaced.
    pub async fn open_command_connection(&self, id: &NodeId) -> Result<Arc<CommandChannel>> {
        if self.discovery.is_none() {
            return Err(Error::NotStarted);
        }
        let record = self.registry.lookup(id)?;

        let mut channels = self.channels.lock().await;
        if let Some(existing) = channels.get(id) {
            if existing.is_open() {
                return Ok(Arc::clone(existing));
            }
            debug!(node = %id, "replacing dead channel");
            channels.remove(id);
        }

        let channel = Arc::new(
            CommandChannel::connect(self.identity.clone(), record.identity, &self.config).await?,
        );
        channels.insert(id.clone(), Arc::clone(&channel));
        Ok(channel)
    }

    /// Runs a command over an open channel.
    ///
    /// Waits at most `timeout`, or the configured default when `None`.
    pub async fn run_command(
        &self,
        channel: &CommandChannel,
        command: impl Into<String>,
        exec_mode: ExecMode,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        let timeout = timeout.unwrap_or(self.config.default_timeout);
        channel.send(command, exec_mode, false, timeout).await
    }

    /// Runs a command with bounded re-open-and-resubmit on transport
    /// failures. This is the only retry loop in the crate; each attempt
    /// re-resolves the channel, so a reconnect after `ConnectionLost` is
    /// covered.
    pub async fn run_command_with_retry(
        &self,
        id: &NodeId,
        command: &str,
        exec_mode: ExecMode,
        policy: RetryPolicy,
    ) -> Result<CommandResult> {
        policy
            .run(|attempt| {
                let command = command.to_string();
                async move {
                    if attempt > 1 {
                        debug!(node = %id, attempt, "retrying command");
                    }
                    let channel = self.open_command_connection(id).await?;
                    self.run_command(channel.as_ref(), command, exec_mode, None).await
                }
            })
            .await
    }

    /// Closes the command connection to a peer, if one is open
    pub async fn close_command_connection(&self, id: &NodeId) {
        if let Some(channel) = self.channels.lock().await.remove(id) {
            channel.close();
        }
    }

    /// Closes all channels and stops discovery and the command server.
    /// Safe to call repeatedly.
    pub async fn stop(&mut self) {
        if self.discovery.is_none() && self.server.is_none() {
            return;
        }
        for (_, channel) in self.channels.lock().await.drain() {
            channel.close();
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
        if let Some(mut discovery) = self.discovery.take() {
            discovery.stop();
        }
        info!(node = %self.identity.id, "session stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;
    use tokio::time::{sleep, timeout};

    /// Evaluates `a+b` integer expressions, enough to stand in for a host
    /// application's interpreter.
    struct ArithmeticHandler;

    impl CommandHandler for ArithmeticHandler {
        fn handle(&self, command: &str, exec_mode: ExecMode, _unattended: bool) -> CommandResult {
            if exec_mode != ExecMode::EvaluateStatement {
                return CommandResult::failure(vec![format!(
                    "unsupported exec mode: {:?}",
                    exec_mode
                )]);
            }
            let mut parts = command.split('+');
            let lhs = parts.next().and_then(|p| p.trim().parse::<i64>().ok());
            let rhs = parts.next().and_then(|p| p.trim().parse::<i64>().ok());
            match (lhs, rhs) {
                (Some(lhs), Some(rhs)) => CommandResult::success((lhs + rhs).to_string()),
                _ => CommandResult::failure(vec![format!("cannot evaluate {:?}", command)]),
            }
        }
    }

    /// Blocks long enough for a test to kill the serving peer mid-command.
    struct StallingHandler;

    impl CommandHandler for StallingHandler {
        fn handle(&self, _command: &str, _exec_mode: ExecMode, _unattended: bool) -> CommandResult {
            std::thread::sleep(Duration::from_millis(1500));
            CommandResult::success("too late")
        }
    }

    fn session(id: &str, command_port: u16, beacon_port: u16) -> Session {
        let identity = NodeIdentity::new(
            id,
            id.to_uppercase(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            command_port,
        );
        let config = Config {
            multicast_interface: Ipv4Addr::LOCALHOST,
            beacon_port,
            beacon_interval: Duration::from_millis(200),
            ttl: Duration::from_millis(1000),
            ..Config::default()
        };
        Session::new(identity, config)
    }

    async fn wait_for_discovery(session: &Session, id: &NodeId) {
        timeout(Duration::from_millis(2000), async {
            while !session.discovered_nodes().iter().any(|n| &n.id == id) {
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("peer {} not discovered", id));
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let mut session = session("ue-a", 49011, 47201);

        // Everything interesting requires a started session.
        assert!(matches!(
            session.open_command_connection(&NodeId::new("ue-b")).await,
            Err(Error::NotStarted)
        ));

        session.start(Arc::new(ArithmeticHandler)).await.unwrap();
        assert!(session.is_running());
        assert!(matches!(
            session.start(Arc::new(ArithmeticHandler)).await,
            Err(Error::AlreadyStarted)
        ));

        session.stop().await;
        session.stop().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_open_unknown_node() {
        let mut session = session("ue-a", 49012, 47202);
        session.start(Arc::new(ArithmeticHandler)).await.unwrap();

        let result = session.open_command_connection(&NodeId::new("ue-ghost")).await;
        assert!(matches!(result, Err(Error::NotFound(_))));

        session.stop().await;
    }

    #[tokio::test]
    async fn test_end_to_end_command() {
        let mut a = session("ue-a", 49013, 47203);
        let mut b = session("ue-b", 49014, 47203);
        a.start(Arc::new(ArithmeticHandler)).await.unwrap();
        b.start(Arc::new(ArithmeticHandler)).await.unwrap();

        wait_for_discovery(&a, &NodeId::new("ue-b")).await;
        wait_for_discovery(&b, &NodeId::new("ue-a")).await;

        let channel = a.open_command_connection(&NodeId::new("ue-b")).await.unwrap();

        // Opening again returns the same channel, not a second connection.
        let again = a.open_command_connection(&NodeId::new("ue-b")).await.unwrap();
        assert!(Arc::ptr_eq(&channel, &again));

        let result = a
            .run_command(
                channel.as_ref(),
                "2+2",
                ExecMode::EvaluateStatement,
                Some(Duration::from_millis(2000)),
            )
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, "4");
        assert!(result.errors.is_empty());

        let failed = a
            .run_command(
                channel.as_ref(),
                "not arithmetic",
                ExecMode::EvaluateStatement,
                None,
            )
            .await
            .unwrap();
        assert!(!failed.success);
        assert!(!failed.errors.is_empty());

        // Closing the connection is not fatal: the retry path re-opens it.
        a.close_command_connection(&NodeId::new("ue-b")).await;
        let retried = a
            .run_command_with_retry(
                &NodeId::new("ue-b"),
                "3+4",
                ExecMode::EvaluateStatement,
                RetryPolicy::default(),
            )
            .await
            .unwrap();
        assert_eq!(retried.output, "7");

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_peer_death_mid_flight() {
        let mut a = session("ue-a", 49015, 47204);
        let mut b = session("ue-b", 49016, 47204);
        a.start(Arc::new(ArithmeticHandler)).await.unwrap();
        b.start(Arc::new(StallingHandler)).await.unwrap();

        wait_for_discovery(&a, &NodeId::new("ue-b")).await;

        let channel = a.open_command_connection(&NodeId::new("ue-b")).await.unwrap();
        let pending_channel = Arc::clone(&channel);
        let pending = tokio::spawn(async move {
            pending_channel
                .send("1+1", ExecMode::EvaluateStatement, false, Duration::from_secs(10))
                .await
        });

        // Let the request reach B, then take B down mid-command.
        sleep(Duration::from_millis(200)).await;
        b.stop().await;

        let started = Instant::now();
        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionLost)));
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "pending command hung instead of failing fast"
        );

        a.stop().await;
    }
}
