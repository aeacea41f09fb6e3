//! Network error types.

use std::sync::Arc;
use std::time::Duration;

use crate::command::CommandTag;

/// Errors that can occur in the holdem_network crate.
///
/// The type is `Clone` so a single failure can be both returned to a caller
/// and reported through the event bridge.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NetworkError {
    /// A stream read or write failed. Fatal to the session, never to the node.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// The remote end closed the stream.
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame announced (or was asked to carry) more bytes than allowed.
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The frame is not a command document at all (no readable tag).
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// The tag was recognized but the payload did not match its shape.
    #[error("Malformed {tag} payload: {reason}")]
    MalformedPayload { tag: CommandTag, reason: String },

    /// The tag is outside the set this node understands.
    #[error("Unknown command tag {0}")]
    UnknownCommand(u64),

    /// An outbound dial did not produce a usable stream.
    #[error("Connect to {peer} failed: {reason}")]
    ConnectFailed { peer: String, reason: String },

    /// The event bridge was full and events were discarded.
    #[error("Event queue overflow ({dropped} events dropped so far)")]
    QueueOverflow { dropped: u64 },

    /// The identity exchange at the start of a stream failed.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// An operation timed out.
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    /// The requested peer has no active session.
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// The node is not running.
    #[error("Node not running")]
    NotRunning,

    /// The initial listener could not be bound.
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// A dial target could not be parsed.
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    /// JSON serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for NetworkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for NetworkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl NetworkError {
    /// Whether this error describes an orderly end of a stream rather than a
    /// failure worth surfacing.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}
