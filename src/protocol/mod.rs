//! Protocol implementation module
//!
//! This module defines the peerlink wire messages and their framed
//! encoding for both datagram and stream transports.

pub mod codec;
pub mod message;

pub use self::codec::{decode_datagram, encode_datagram, MessageCodec};
pub use self::message::{Message, MessageId, MessageKind};

/// Maximum accepted stream frame size in bytes
///
/// Stream messages are unbounded by the datagram MTU but a length prefix
/// claiming more than this is treated as a malformed frame.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
