//! Core types for the BitRelay engine
//!
//! This module defines the fundamental types used throughout the relay core,
//! using newtype patterns for semantic validation and type safety.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{PacketError, RelayError};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Maximum length of a peer identifier on the wire
pub const MAX_PEER_ID_LEN: usize = 64;

/// Stable identifier for a radio-reachable peer
///
/// Derived from the peer's link-layer address with separators stripped, so
/// `AA:BB:CC:DD:EE:FF` and `aa-bb-cc-dd-ee-ff` name the same peer.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    /// Create a PeerId from an already-normalized identifier
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    /// Derive a PeerId from a link-layer address
    pub fn from_address(address: &str) -> Self {
        let id: String = address
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
            .map(|c| c.to_ascii_uppercase())
            .collect();
        Self(id)
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Get the raw bytes used on the wire
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    /// Rebuild a PeerId from wire bytes
    pub fn from_wire(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.is_empty() {
            return Err(PacketError::from("Empty peer id"));
        }
        if bytes.len() > MAX_PEER_ID_LEN {
            return Err(PacketError::FieldTooLarge {
                field: "peer_id",
                max: MAX_PEER_ID_LEN,
                actual: bytes.len(),
            });
        }
        core::str::from_utf8(bytes)
            .map(|s| Self(s.to_string()))
            .map_err(|_| PacketError::from("Peer id is not valid UTF-8"))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let peer = Self::from_address(s.trim());
        if peer.0.is_empty() {
            return Err(RelayError::invalid_packet("Empty peer id"));
        }
        if peer.0.len() > MAX_PEER_ID_LEN {
            return Err(RelayError::invalid_packet("Peer id too long"));
        }
        Ok(peer)
    }
}

impl Deref for PeerId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(other.as_millis() as u64))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Get current wall-clock timestamp
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp (zero if `other` is later)
    pub fn duration_since(&self, other: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Whether more than `window` has elapsed between `self` and `now`
    pub fn is_older_than(&self, window: Duration, now: Timestamp) -> bool {
        now.duration_since(*self) > window
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Source of timestamps for freshness, TTL and queue-age decisions
///
/// Runtime components take an `Arc<dyn TimeSource>` so tests can substitute
/// a manually advanced clock.
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Standard library implementation of TimeSource
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_address() {
        let a = PeerId::from_address("aa:bb:cc:dd:ee:ff");
        let b = PeerId::from_address("AA-BB-CC-DD-EE-FF");
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "AABBCCDDEEFF");
    }

    #[test]
    fn test_peer_id_wire_roundtrip_rejects_oversize() {
        let long = vec![b'A'; MAX_PEER_ID_LEN + 1];
        assert!(PeerId::from_wire(&long).is_err());
        assert!(PeerId::from_wire(b"").is_err());
        assert_eq!(PeerId::from_wire(b"NODE1").unwrap(), PeerId::new("NODE1"));
    }

    #[test]
    fn test_peer_id_from_str() {
        let peer: PeerId = "11:22:33:44:55:66".parse().unwrap();
        assert_eq!(peer.as_str(), "112233445566");
        assert!("::".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let t = Timestamp::new(1_000);
        assert_eq!((t + 500).as_millis(), 1_500);
        assert_eq!((t + Duration::from_secs(2)).as_millis(), 3_000);
        assert_eq!(Timestamp::new(3_000) - t, 2_000);
        assert_eq!(t - Timestamp::new(3_000), 0);
        assert!(t.is_older_than(Duration::from_millis(100), Timestamp::new(1_101)));
        assert!(!t.is_older_than(Duration::from_millis(100), Timestamp::new(1_100)));
    }
}
