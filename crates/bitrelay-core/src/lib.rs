//! BitRelay Core
//!
//! Shared foundation of the BitRelay mesh routing engine: peer and time
//! types, the error taxonomy, configuration, the `MeshPacket` wire format,
//! relay capability classification and scoring, route estimation, the dedup
//! cache, the pending queue, chunk encodings and the radio link contract.
//!
//! Nothing here owns tasks or locks; the `bitrelay-runtime` crate builds the
//! discoverer, forwarder and router on top of these pieces.

extern crate alloc;

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod capability;
pub mod chunking;
pub mod config;
pub mod dedup;
pub mod errors;
pub mod packet;
pub mod pending;
pub mod radio;
pub mod route;
pub mod types;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use capability::{
    classify, reliability_score, signal_bonus, AdvertisedHints, HijackKind, RelayCapability,
    RelayCapableDevice, RelayPeer, Sighting, TransportStrategy,
};
pub use chunking::{chunk_payload, ChunkReassembler};
pub use config::{DiscoveryConfig, ForwarderConfig, RelayConfig, RouterConfig};
pub use dedup::{DeduplicationManager, DeduplicationStats};
pub use errors::{PacketError, RelayError, RelayResult, Result, TransportError};
pub use packet::{ControlMessage, Frame, MeshPacket};
pub use pending::{PendingEntry, PendingQueue};
pub use radio::{AdvertisementPayload, RadioChannel, RadioEvent, RadioLink};
pub use route::{
    estimate_latency, path_reliability, rank_candidates, RouteEntry, RouteKind, RoutePath,
    RoutingTable,
};
pub use types::{PeerId, SystemTimeSource, TimeSource, Timestamp};
