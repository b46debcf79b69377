//! Error types for the BitRelay routing engine
//!
//! This module contains all error types used throughout the relay core,
//! including transport errors, packet validation errors, and the main
//! RelayError type that unifies them all.

use uuid::Uuid;

use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Specific transport error types
///
/// Platform radio errors (permission denied, adapter disabled, device
/// unreachable) are all folded into [`TransportError::Unavailable`]; the
/// core never interprets platform-specific codes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Radio link is not available: {reason}")]
    Unavailable { reason: String },
    #[error("Transfer timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },
    #[error("Connection failed to peer {peer_id}: {reason}")]
    ConnectionFailed { peer_id: String, reason: String },
    #[error("Send failed to peer {peer_id}: {reason}")]
    SendFailed { peer_id: String, reason: String },
    #[error("Peer not found: {peer_id}")]
    PeerNotFound { peer_id: String },
}

/// Specific packet validation error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("Packet too short (expected at least {expected}, got {actual})")]
    TooShort { expected: usize, actual: usize },
    #[error("Unsupported wire version: {version}")]
    UnsupportedVersion { version: u8 },
    #[error("Unknown frame type: {frame_type}")]
    UnknownFrameType { frame_type: u8 },
    #[error("Checksum verification failed")]
    ChecksumFailed,
    #[error("Field {field} too large (max {max}, got {actual})")]
    FieldTooLarge {
        field: &'static str,
        max: usize,
        actual: usize,
    },
    #[error("Route already contains peer {peer_id}")]
    RouteLoop { peer_id: String },
    #[error("{message}")]
    Generic { message: String },
}

impl From<String> for PacketError {
    fn from(message: String) -> Self {
        PacketError::Generic { message }
    }
}

impl From<&str> for PacketError {
    fn from(message: &str) -> Self {
        PacketError::Generic {
            message: message.to_string(),
        }
    }
}

// ----------------------------------------------------------------------------
// Relay Error
// ----------------------------------------------------------------------------

/// Core error types for the BitRelay engine
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid packet: {0}")]
    InvalidPacket(#[from] PacketError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Dedup hit; silently dropped by the forwarder
    #[error("Duplicate packet {message_id}")]
    DuplicatePacket { message_id: Uuid },

    #[error("Packet {message_id} expired")]
    TtlExpired { message_id: Uuid },

    #[error("Packet {message_id} reached hop limit ({hops})")]
    HopLimitExceeded { message_id: Uuid, hops: u8 },

    #[error("No route found to {target}")]
    NoRouteFound { target: PeerId },

    /// Pending entry aged out or ran out of retries
    #[error("Pending entry {entry_id} exhausted")]
    QueueExhausted { entry_id: Uuid },

    #[error("Configuration error: {reason}")]
    Configuration { reason: String },

    /// Channel communication error (internal task plumbing)
    #[error("Channel error: {message}")]
    Channel { message: String },
}

// ----------------------------------------------------------------------------
// Convenience Error Constructors
// ----------------------------------------------------------------------------

impl RelayError {
    /// Create an invalid packet error with a message
    pub fn invalid_packet<T: Into<String>>(message: T) -> Self {
        RelayError::InvalidPacket(PacketError::Generic {
            message: message.into(),
        })
    }

    /// Create a transport unavailable error
    pub fn transport_unavailable<T: Into<String>>(reason: T) -> Self {
        RelayError::Transport(TransportError::Unavailable {
            reason: reason.into(),
        })
    }

    /// Create a timeout error
    pub fn timeout(duration_ms: u64) -> Self {
        RelayError::Transport(TransportError::Timeout { duration_ms })
    }

    /// Create a send failure for a peer
    pub fn send_failed<R: Into<String>>(peer_id: &PeerId, reason: R) -> Self {
        RelayError::Transport(TransportError::SendFailed {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        })
    }

    /// Create a connection failure for a peer
    pub fn connection_failed<R: Into<String>>(peer_id: &PeerId, reason: R) -> Self {
        RelayError::Transport(TransportError::ConnectionFailed {
            peer_id: peer_id.to_string(),
            reason: reason.into(),
        })
    }

    /// Create a peer-not-found error
    pub fn peer_not_found(peer_id: &PeerId) -> Self {
        RelayError::Transport(TransportError::PeerNotFound {
            peer_id: peer_id.to_string(),
        })
    }

    /// Create a configuration error with a reason
    pub fn config_error<T: Into<String>>(reason: T) -> Self {
        RelayError::Configuration {
            reason: reason.into(),
        }
    }

    /// Create a channel error with a message
    pub fn channel_error<T: Into<String>>(message: T) -> Self {
        RelayError::Channel {
            message: message.into(),
        }
    }

    /// Whether this error means the radio itself is unusable
    ///
    /// Unavailability is fatal for the current attempt; callers do not retry
    /// other strategies against the same call.
    pub fn is_transport_unavailable(&self) -> bool {
        matches!(
            self,
            RelayError::Transport(TransportError::Unavailable { .. })
        )
    }

    /// Whether this error is a single-hop timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, RelayError::Transport(TransportError::Timeout { .. }))
    }
}

// ----------------------------------------------------------------------------
// Type Aliases
// ----------------------------------------------------------------------------

pub type Result<T> = core::result::Result<T, RelayError>;
pub type RelayResult<T> = Result<T>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(RelayError::transport_unavailable("adapter off").is_transport_unavailable());
        assert!(RelayError::timeout(3000).is_timeout());
        assert!(!RelayError::timeout(3000).is_transport_unavailable());
        assert!(!RelayError::invalid_packet("bad").is_timeout());
    }

    #[test]
    fn test_error_display() {
        let peer = PeerId::new("AABBCCDDEEFF");
        let err = RelayError::send_failed(&peer, "link dropped");
        assert_eq!(
            err.to_string(),
            "Transport error: Send failed to peer AABBCCDDEEFF: link dropped"
        );
    }
}
