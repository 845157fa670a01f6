//! peerlink: peer discovery and remote command execution
//!
//! Independent application instances on a local network announce themselves
//! over multicast, find each other, and execute opaque commands against one
//! another over reliable per-peer channels.

pub mod core;
pub mod network;
pub mod protocol;
pub mod session;
pub mod util;

// Re-export commonly used items
pub use self::core::{
    CommandResult, Config, Error, ExecMode, NodeId, NodeIdentity, Result,
};
pub use self::network::{CommandHandler, RegistryEvent};
pub use self::session::Session;
pub use self::util::RetryPolicy;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
