use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::core::{Config, Error, NodeIdentity, Result};
use crate::protocol::{decode_datagram, encode_datagram, Message, MessageId, MessageKind};
use super::registry::NodeRegistry;

/// Lifecycle state of a discovery service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// No loops running, no socket bound
    Stopped,
    /// Binding the beacon socket
    Starting,
    /// Beacon, listener and sweep loops running
    Running,
    /// Tearing the loops down
    Stopping,
}

/// Maintains a live view of peers reachable on the local broadcast domain
///
/// One instance per node; multiple instances are independently constructible
/// in one process (two test peers, for example). `Running` owns three loops:
/// the beacon loop announcing this node, the listener loop ingesting other
/// nodes' announcements, and the sweep loop expiring silent peers.
pub struct DiscoveryService {
    /// Identity announced in beacons
    identity: NodeIdentity,
    /// Configuration
    config: Config,
    /// Registry populated by the listener and sweep loops
    registry: NodeRegistry,
    /// Current lifecycle state
    state: ServiceState,
    /// Message id counter shared by the beacon and listener loops
    next_message_id: Arc<AtomicU64>,
    /// Running loop tasks
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Creates a stopped discovery service
    pub fn new(identity: NodeIdentity, config: Config, registry: NodeRegistry) -> Self {
        DiscoveryService {
            identity,
            config,
            registry,
            state: ServiceState::Stopped,
            next_message_id: Arc::new(AtomicU64::new(1)),
            tasks: Vec::new(),
        }
    }

    /// Returns the current lifecycle state
    pub fn state(&self) -> ServiceState {
        self.state
    }

    /// Returns the registry this service populates
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Binds and starts the beacon, listener and sweep loops
    pub async fn start(&mut self) -> Result<()> {
        if self.state != ServiceState::Stopped {
            return Err(Error::AlreadyStarted);
        }
        self.state = ServiceState::Starting;

        let socket = match Self::bind_beacon_socket(&self.config).and_then(|s| {
            UdpSocket::from_std(s).map_err(Error::Io)
        }) {
            Ok(socket) => Arc::new(socket),
            Err(e) => {
                self.state = ServiceState::Stopped;
                return Err(e);
            }
        };
        let group_addr = SocketAddr::from(SocketAddrV4::new(
            self.config.multicast_group,
            self.config.beacon_port,
        ));

        let beacon = self.spawn_beacon_loop(Arc::clone(&socket), group_addr);
        let listener = self.spawn_listener_loop(socket);
        let sweep = self.spawn_sweep_loop();
        self.tasks.extend([beacon, listener, sweep]);

        self.state = ServiceState::Running;
        info!(node = %self.identity.id, group = %group_addr, "discovery started");
        Ok(())
    }

    /// Stops all loops; safe to call repeatedly
    pub fn stop(&mut self) {
        if self.state == ServiceState::Stopped {
            return;
        }
        self.state = ServiceState::Stopping;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.state = ServiceState::Stopped;
        info!(node = %self.identity.id, "discovery stopped");
    }

    /// Configures the shared beacon socket.
    ///
    /// Reuse flags let several instances on one host share the beacon port;
    /// loopback delivery lets them hear each other's multicasts.
    fn bind_beacon_socket(config: &Config) -> Result<std::net::UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        #[cfg(unix)]
        socket.set_reuse_port(true)?;
        socket.set_nonblocking(true)?;

        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.beacon_port));
        socket.bind(&bind_addr.into())?;
        socket.join_multicast_v4(&config.multicast_group, &config.multicast_interface)?;
        socket.set_multicast_loop_v4(true)?;
        socket.set_multicast_if_v4(&config.multicast_interface)?;

        Ok(socket.into())
    }

    fn spawn_beacon_loop(&self, socket: Arc<UdpSocket>, group_addr: SocketAddr) -> JoinHandle<()> {
        let identity = self.identity.clone();
        let beacon_interval = self.config.beacon_interval;
        let counter = Arc::clone(&self.next_message_id);

        tokio::spawn(async move {
            let mut ticker = interval(beacon_interval);
            loop {
                ticker.tick().await;
                let message_id = MessageId(counter.fetch_add(1, Ordering::Relaxed));
                let hello = Message::hello(identity.clone(), message_id);
                match encode_datagram(&hello) {
                    Ok(frame) => {
                        if let Err(e) = socket.send_to(&frame, group_addr).await {
                            warn!(error = %e, "failed to send beacon");
                        }
                    }
                    Err(e) => warn!(error = %e, "failed to encode beacon"),
                }
            }
        })
    }

    fn spawn_listener_loop(&self, socket: Arc<UdpSocket>) -> JoinHandle<()> {
        let identity = self.identity.clone();
        let registry = self.registry.clone();
        let ttl = self.config.ttl;
        let counter = Arc::clone(&self.next_message_id);

        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let (len, addr) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(e) => {
                        warn!(error = %e, "beacon receive failed");
                        continue;
                    }
                };

                let message = match decode_datagram(&buf[..len]) {
                    Ok(message) => message,
                    Err(e) => {
                        debug!(error = %e, %addr, "discarding malformed datagram");
                        continue;
                    }
                };

                // Our own beacons loop back on the shared socket.
                if message.source == identity.id {
                    continue;
                }

                match message.kind {
                    MessageKind::Hello { identity: sender } => {
                        let needs_pong = match registry.lookup(&sender.id) {
                            Ok(record) => record.is_stale(Instant::now(), ttl),
                            Err(_) => true,
                        };
                        registry.upsert(sender.clone());
                        if needs_pong {
                            let message_id = MessageId(counter.fetch_add(1, Ordering::Relaxed));
                            let pong =
                                Message::pong(identity.clone(), sender.id.clone(), message_id);
                            match encode_datagram(&pong) {
                                Ok(frame) => {
                                    if let Err(e) = socket.send_to(&frame, addr).await {
                                        warn!(error = %e, %addr, "failed to send pong");
                                    }
                                }
                                Err(e) => warn!(error = %e, "failed to encode pong"),
                            }
                        }
                    }
                    // Pongs are never replied to, which keeps a hello from
                    // fanning out into a broadcast storm.
                    MessageKind::Pong { identity: sender } => {
                        registry.upsert(sender);
                    }
                    other => {
                        debug!(kind = other.name(), %addr, "discarding unexpected datagram kind");
                    }
                }
            }
        })
    }

    fn spawn_sweep_loop(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let ttl = self.config.ttl;

        tokio::spawn(async move {
            let mut ticker = interval(ttl / 2);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                registry.mark_stale(now, ttl);
                for id in registry.evict_expired(now, ttl) {
                    info!(node = %id, "peer lost");
                }
            }
        })
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
