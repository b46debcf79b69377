//! Stateful helpers shared by the runtime components
//!
//! Per-peer link serialization and the statistics stores.

pub mod link;
pub mod statistics;

pub use link::PeerLocks;
pub use statistics::{ForwarderCounters, ForwarderStatistics, RoutingStatistics};
