//! WebSocket Error Types
//!
//! Errors are split by how far they propagate:
//!
//! - [`HandshakeError`]: the connection is rejected before a session exists.
//! - [`ProtocolError`]: a bad inbound frame; answered with an `error` message,
//!   the session stays active.
//! - [`SessionError`]: fatal for one session; ends in teardown and a single
//!   unregister.
//! - [`RegistryError`]: refusals from the connection registry.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Upgrade or identity resolution failed; no session resources exist yet.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Invalid identity header {header}: {value:?}")]
    InvalidIdentity { header: String, value: String },
}

/// Malformed or disallowed inbound frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Invalid message format: {0}")]
    InvalidJson(String),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Message type {kind} requires field {field}")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Message type {kind} does not accept field {field}")]
    UnexpectedField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("Message type {0} cannot be sent by clients")]
    NotAccepted(&'static str),

    #[error("Binary messages not supported")]
    Binary,

    #[error("Invalid topic: {0:?}")]
    InvalidTopic(String),

    #[error("Subscription limit reached ({limit} topics per connection)")]
    SubscriptionLimit { limit: usize },
}

/// Fatal session failure. Every variant leads to teardown.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Mailbox full (capacity {capacity})")]
    Backpressure { capacity: usize },

    #[error("No inbound activity for {0:?}")]
    LivenessTimeout(Duration),
}

impl SessionError {
    /// The close reason recorded when this error ends a session.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            SessionError::Transport(_) => CloseReason::Transport,
            SessionError::Backpressure { .. } => CloseReason::Backpressure,
            SessionError::LivenessTimeout(_) => CloseReason::LivenessTimeout,
        }
    }
}

/// Why a session left the Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer sent a close frame or the stream ended.
    PeerClosed,
    /// Read or write on the socket failed.
    Transport,
    /// Mailbox overflowed.
    Backpressure,
    /// Peer stopped answering pings.
    LivenessTimeout,
    /// Hub shutdown requested.
    Shutdown,
    /// Removed from the registry by someone other than the session itself.
    Removed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::Transport => "transport",
            CloseReason::Backpressure => "backpressure",
            CloseReason::LivenessTimeout => "liveness_timeout",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Removed => "removed",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur in the connection registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Too many connections (limit: {limit})")]
    TooManyConnections { limit: usize },

    #[error("Connection hub is shutting down")]
    ShuttingDown,

    #[error("Connection not found")]
    ConnectionNotFound,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
