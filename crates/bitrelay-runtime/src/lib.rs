//! BitRelay Runtime Engine
//!
//! This crate runs a relay node on top of `bitrelay-core`:
//! - `CapabilityDiscoverer`: scores sighted peers and performs one-hop transfers
//! - `MeshForwarder`: loop-free, TTL-bounded hop-by-hop forwarding
//! - `SmartRouter`: candidate ranking, ordered delivery attempts and retries
//! - Background tasks and the `RuntimeBuilder` that starts them

pub mod builder;
pub mod discoverer;
pub mod forwarder;
pub mod managers;
pub mod router;
mod runtime;
pub mod tasks;

pub use builder::RuntimeBuilder;
pub use discoverer::CapabilityDiscoverer;
pub use forwarder::{DeliveredMessage, DropReason, MeshForwarder, RelayOutcome, RouteSearch};
pub use managers::*;
pub use router::{OutboundMessage, RoutingResult, RoutingStatus, SmartRouter};
pub use runtime::*;

// Re-export core types for convenience
pub use bitrelay_core::{
    PeerId, RelayCapableDevice, RelayConfig, RelayError, RelayResult, RoutePath, RouteKind,
    Sighting,
};
