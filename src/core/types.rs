use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Node identifier in the network
///
/// Opaque string chosen by the announcing instance. Uniqueness within the
/// broadcast domain is the announcer's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID from a string
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    /// Generates a new random node ID
    pub fn random() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let raw: u64 = rng.gen();
        NodeId(format!("node-{:016x}", raw))
    }

    /// Returns the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        NodeId(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        NodeId(id)
    }
}

/// Immutable description of a peer as announced in its beacons
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeIdentity {
    /// The peer's node ID
    pub id: NodeId,
    /// Human-readable name shown in peer listings
    pub display_name: String,
    /// Address the peer accepts command connections on
    pub host: IpAddr,
    /// Port the peer accepts command connections on
    pub command_port: u16,
}

impl NodeIdentity {
    /// Creates a new identity
    pub fn new(
        id: impl Into<NodeId>,
        display_name: impl Into<String>,
        host: IpAddr,
        command_port: u16,
    ) -> Self {
        NodeIdentity {
            id: id.into(),
            display_name: display_name.into(),
            host,
            command_port,
        }
    }

    /// Returns the address commands should be sent to
    pub fn command_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.command_port)
    }
}

// Identities are compared by id; the rest of the fields are advertisement
// detail a peer may legitimately change between restarts.
impl PartialEq for NodeIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for NodeIdentity {}

/// Liveness state of a registry record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Seen within the freshness window
    Discovered,
    /// Unrefreshed past half the TTL, not yet evicted
    Stale,
}

/// Mutable registry entry for a known peer
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// The peer's announced identity
    pub identity: NodeIdentity,
    /// When a beacon from this peer was last received
    pub last_seen: Instant,
    /// Current liveness state
    pub state: RecordState,
}

impl NodeRecord {
    /// Creates a fresh record for a newly seen peer
    pub fn new(identity: NodeIdentity, now: Instant) -> Self {
        NodeRecord {
            identity,
            last_seen: now,
            state: RecordState::Discovered,
        }
    }

    /// Returns whether this record has gone unrefreshed past half the TTL
    pub fn is_stale(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl / 2
    }

    /// Returns whether this record has gone unrefreshed past the full TTL
    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > ttl
    }
}

/// How the receiving peer should interpret a command string
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecMode {
    /// Execute the payload as a statement
    ExecuteStatement,
    /// Execute the payload as a file path
    ExecuteFile,
    /// Evaluate the payload as an expression and return its value
    EvaluateStatement,
}

/// Outcome of executing a command on the remote peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Whether the command completed without errors
    pub success: bool,
    /// Captured output of the command
    pub output: String,
    /// Errors reported by the executor, in occurrence order
    pub errors: Vec<String>,
}

impl CommandResult {
    /// Creates a successful result with the given output
    pub fn success(output: impl Into<String>) -> Self {
        CommandResult {
            success: true,
            output: output.into(),
            errors: Vec::new(),
        }
    }

    /// Creates a failed result carrying the given errors
    pub fn failure(errors: Vec<String>) -> Self {
        CommandResult {
            success: false,
            output: String::new(),
            errors,
        }
    }
}

/// Configuration for a peerlink node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Multicast group beacons are sent to
    pub multicast_group: Ipv4Addr,
    /// Local interface used for multicast membership and sends
    pub multicast_interface: Ipv4Addr,
    /// Port the multicast group uses
    pub beacon_port: u16,
    /// Interval between presence beacons
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub beacon_interval: Duration,
    /// Silence duration after which a peer is considered gone
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub ttl: Duration,
    /// Timeout applied to commands when the caller does not pass one
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub default_timeout: Duration,
    /// Timeout for the version handshake on new command connections
    #[serde(serialize_with = "super::serde::serialize_duration")]
    #[serde(deserialize_with = "super::serde::deserialize_duration")]
    pub handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            multicast_group: super::DEFAULT_MULTICAST_GROUP,
            multicast_interface: Ipv4Addr::UNSPECIFIED,
            beacon_port: super::DEFAULT_BEACON_PORT,
            beacon_interval: Duration::from_millis(1000),
            ttl: Duration::from_millis(5000),
            default_timeout: Duration::from_millis(3000),
            handshake_timeout: Duration::from_millis(2000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_random() {
        let id1 = NodeId::random();
        let id2 = NodeId::random();
        assert_ne!(id1, id2);
        assert!(id1.as_str().starts_with("node-"));
    }

    #[test]
    fn test_identity_compared_by_id() {
        let a = NodeIdentity::new("ue-a", "Editor A", IpAddr::V4(Ipv4Addr::LOCALHOST), 9001);
        let b = NodeIdentity::new("ue-a", "Renamed", IpAddr::V4(Ipv4Addr::LOCALHOST), 9002);
        let c = NodeIdentity::new("ue-b", "Editor A", IpAddr::V4(Ipv4Addr::LOCALHOST), 9001);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.command_addr(), "127.0.0.1:9001".parse().unwrap());
    }

    #[test]
    fn test_record_liveness() {
        let identity =
            NodeIdentity::new("ue-a", "Editor A", IpAddr::V4(Ipv4Addr::LOCALHOST), 9001);
        let now = Instant::now();
        let ttl = Duration::from_secs(5);
        let record = NodeRecord::new(identity, now);

        assert_eq!(record.state, RecordState::Discovered);
        assert!(!record.is_stale(now, ttl));
        assert!(record.is_stale(now + Duration::from_secs(3), ttl));
        assert!(!record.is_expired(now + Duration::from_secs(3), ttl));
        assert!(record.is_expired(now + Duration::from_secs(6), ttl));
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let json = serde_json::to_string(&config).unwrap();
        let decoded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.beacon_interval, config.beacon_interval);
        assert_eq!(decoded.ttl, config.ttl);
        assert_eq!(decoded.multicast_group, config.multicast_group);
    }
}
