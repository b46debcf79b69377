//! Radio link abstraction
//!
//! The relay engine never touches a platform radio directly. Platform
//! transports implement [`RadioLink`]; every platform failure (permission
//! denied, adapter disabled, device unreachable) is reported as
//! [`TransportError::Unavailable`](crate::errors::TransportError::Unavailable)
//! or a per-peer transport error.

use alloc::{boxed::Box, vec::Vec};
use async_trait::async_trait;
use core::time::Duration;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::capability::{AdvertisedHints, Sighting, TransportStrategy};
use crate::errors::Result;
use crate::types::PeerId;

// ----------------------------------------------------------------------------
// Radio Events
// ----------------------------------------------------------------------------

/// Events pushed from the radio to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Bytes arrived from a peer over a channel or advertisement
    Frame { from: PeerId, bytes: Vec<u8> },
    /// A peer opened a connection to us
    Connected { peer_id: PeerId, signal_strength: i16 },
    /// A connected peer went away
    Disconnected { peer_id: PeerId },
}

/// Data placed into a short-lived advertisement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertisementPayload {
    LocalName(String),
    ManufacturerData { company_id: u16, data: Vec<u8> },
    ServiceData { service: Uuid, data: Vec<u8> },
}

impl AdvertisementPayload {
    /// Raw bytes carried by the advertisement
    pub fn data_len(&self) -> usize {
        match self {
            AdvertisementPayload::LocalName(name) => name.len(),
            AdvertisementPayload::ManufacturerData { data, .. } => data.len(),
            AdvertisementPayload::ServiceData { data, .. } => data.len(),
        }
    }
}

// ----------------------------------------------------------------------------
// Radio Traits
// ----------------------------------------------------------------------------

/// Bidirectional channel to one peer
#[async_trait]
pub trait RadioChannel: Send {
    /// Peer at the other end
    fn peer_id(&self) -> &PeerId;

    /// Write bytes to the peer
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// Close the channel
    async fn close(&mut self) -> Result<()>;
}

/// Platform radio capability consumed by the engine
#[async_trait]
pub trait RadioLink: Send + Sync {
    /// Identifier other peers know this node by
    fn local_id(&self) -> PeerId;

    /// Start an infinite, restartable stream of presence sightings
    async fn scan(&self) -> Result<BoxStream<'static, Sighting>>;

    /// Advertise this node's presence
    async fn advertise_presence(&self, hints: AdvertisedHints) -> Result<()>;

    /// Stop advertising presence
    async fn stop_advertising(&self) -> Result<()>;

    /// Open a channel to `peer` using the given strategy hint
    async fn open_channel(
        &self,
        peer: &PeerId,
        strategy: &TransportStrategy,
    ) -> Result<Box<dyn RadioChannel>>;

    /// Emit a short-lived advertisement for `window`
    async fn emit_advertisement(&self, payload: AdvertisementPayload, window: Duration)
        -> Result<()>;

    /// Take the inbound event stream; only the first caller receives it
    fn take_events(&self) -> Option<BoxStream<'static, RadioEvent>>;
}
