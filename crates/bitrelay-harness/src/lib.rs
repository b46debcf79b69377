//! BitRelay test harness
//!
//! A simulated radio medium ([`VirtualAir`]) with per-node radios that
//! implement the engine's `RadioLink` contract, plus a manual clock. Used by
//! the runtime's integration tests and by the CLI's scenario runner.

pub mod air;
pub mod clock;
pub mod radio;

pub use air::{AirConfig, TransferRecord, VirtualAir};
pub use clock::ManualClock;
pub use radio::SimulatedRadio;
