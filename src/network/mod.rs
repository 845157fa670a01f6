//! Network management and peer communication module
//!
//! This module handles peer discovery, the peer registry, and the command
//! connections between peers.

pub mod channel;
pub mod discovery;
pub mod registry;
pub mod server;

pub use self::channel::CommandChannel;
pub use self::discovery::{DiscoveryService, ServiceState};
pub use self::registry::{NodeRegistry, RegistryEvent};
pub use self::server::{CommandHandler, CommandServer};
