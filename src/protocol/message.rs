use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{CommandResult, ExecMode, NodeId, NodeIdentity};

/// Correlation key shared by a request and its response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub u64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol message types for node communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Presence announcement, broadcast or sent as the stream handshake
    Hello {
        /// Announcing node's identity
        identity: NodeIdentity,
    },

    /// Unicast reply to a Hello from an unknown or stale peer
    Pong {
        /// Responding node's identity
        identity: NodeIdentity,
    },

    /// Command to be executed by the receiving peer
    CommandRequest {
        /// Opaque command string; semantics belong to the executor
        command: String,
        /// Whether the executor should suppress interactive prompts
        unattended: bool,
        /// How the executor should interpret the command
        exec_mode: ExecMode,
    },

    /// Result of an executed command
    CommandResponse {
        /// Execution outcome
        result: CommandResult,
    },

    /// Receipt acknowledgment for a command request
    Ack,
}

impl MessageKind {
    /// Returns a short name for logging
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Hello { .. } => "Hello",
            MessageKind::Pong { .. } => "Pong",
            MessageKind::CommandRequest { .. } => "CommandRequest",
            MessageKind::CommandResponse { .. } => "CommandResponse",
            MessageKind::Ack => "Ack",
        }
    }
}

/// The wire unit: a routed, correlatable protocol message
///
/// Messages are values; nothing mutates one after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sending node's ID
    pub source: NodeId,
    /// Receiving node's ID; `None` means broadcast
    pub destination: Option<NodeId>,
    /// Correlation key, unique per request on its channel
    pub message_id: MessageId,
    /// Type-dependent payload
    pub kind: MessageKind,
}

impl Message {
    /// Creates a broadcast Hello beacon
    pub fn hello(identity: NodeIdentity, message_id: MessageId) -> Self {
        Message {
            source: identity.id.clone(),
            destination: None,
            message_id,
            kind: MessageKind::Hello { identity },
        }
    }

    /// Creates a handshake Hello addressed to a specific peer
    pub fn hello_to(identity: NodeIdentity, destination: NodeId, message_id: MessageId) -> Self {
        Message {
            source: identity.id.clone(),
            destination: Some(destination),
            message_id,
            kind: MessageKind::Hello { identity },
        }
    }

    /// Creates a unicast Pong reply
    pub fn pong(identity: NodeIdentity, destination: NodeId, message_id: MessageId) -> Self {
        Message {
            source: identity.id.clone(),
            destination: Some(destination),
            message_id,
            kind: MessageKind::Pong { identity },
        }
    }

    /// Creates a command request
    pub fn request(
        source: NodeId,
        destination: NodeId,
        message_id: MessageId,
        command: impl Into<String>,
        exec_mode: ExecMode,
        unattended: bool,
    ) -> Self {
        Message {
            source,
            destination: Some(destination),
            message_id,
            kind: MessageKind::CommandRequest {
                command: command.into(),
                unattended,
                exec_mode,
            },
        }
    }

    /// Creates a command response correlated to `message_id`
    pub fn response(
        source: NodeId,
        destination: NodeId,
        message_id: MessageId,
        result: CommandResult,
    ) -> Self {
        Message {
            source,
            destination: Some(destination),
            message_id,
            kind: MessageKind::CommandResponse { result },
        }
    }

    /// Creates a receipt acknowledgment correlated to `message_id`
    pub fn ack(source: NodeId, destination: NodeId, message_id: MessageId) -> Self {
        Message {
            source,
            destination: Some(destination),
            message_id,
            kind: MessageKind::Ack,
        }
    }

    /// Returns whether this message is a broadcast
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_none()
    }
}
