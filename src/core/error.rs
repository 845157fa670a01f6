use std::io;
use thiserror::Error;

use super::types::NodeId;

/// Custom error types for peerlink
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported protocol version: expected {expected}, got {actual}")]
    UnsupportedVersion { expected: u8, actual: u8 },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("payload too large: {size} bytes exceeds limit of {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("discovery already started")]
    AlreadyStarted,

    #[error("discovery not started")]
    NotStarted,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("request timed out")]
    TimedOut,

    #[error("connection lost")]
    ConnectionLost,

    #[error("channel closed")]
    ChannelClosed,

    #[error("unknown node: {0}")]
    NotFound(NodeId),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new malformed-frame error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedFrame(msg.into())
    }

    /// Creates a new connect-failed error
    pub fn connect_failed(msg: impl Into<String>) -> Self {
        Error::ConnectFailed(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Returns whether retrying the failed operation may succeed.
    ///
    /// Transport-level failures are worth a bounded retry; protocol and
    /// usage errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::ConnectFailed(_)
                | Error::TimedOut
                | Error::ConnectionLost
                | Error::ChannelClosed
        )
    }
}
