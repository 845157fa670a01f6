//! Core types for the peerlink protocol
//!
//! This module contains the fundamental building blocks used throughout the library.

pub mod error;
pub mod serde;
pub mod types;

pub use self::error::{Error, Result};
pub use self::types::{
    CommandResult,
    Config,
    ExecMode,
    NodeId,
    NodeIdentity,
    NodeRecord,
    RecordState,
};

use std::net::Ipv4Addr;

/// Protocol version; peers must match exactly
pub const PROTOCOL_VERSION: u8 = 1;

/// Default multicast group beacons are sent to
pub const DEFAULT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 0, 0, 1);

/// Default port for the multicast beacon group
pub const DEFAULT_BEACON_PORT: u16 = 6766;

/// Default port for incoming command connections
pub const DEFAULT_COMMAND_PORT: u16 = 6776;

/// Maximum encoded size of a beacon datagram in bytes
pub const MAX_DATAGRAM_SIZE: usize = 1400;
