//! Configuration for the BitRelay engine
//!
//! All durations are stored as integer milliseconds so configurations
//! round-trip cleanly through TOML; accessor methods expose them as
//! [`Duration`]s.

use core::time::Duration;
use serde::{Deserialize, Serialize};

use crate::errors::{RelayError, Result};

// ----------------------------------------------------------------------------
// Discovery Configuration
// ----------------------------------------------------------------------------

/// Configuration for relay capability discovery and single-hop transfers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Peers not seen within this window are evicted and never routed through
    pub freshness_window_ms: u64,
    /// Peers at or below this signal strength are not viable
    pub signal_floor_dbm: i16,
    /// Timeout for a single broadcast-style strategy attempt
    pub strategy_timeout_ms: u64,
    /// Timeout for opening and writing a structured channel
    pub channel_timeout_ms: u64,
    /// Pause between consecutive broadcast chunks
    pub chunk_delay_ms: u64,
    /// Minimum reliability score for a generic relay to become a route
    pub universal_reliability_floor: f32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            freshness_window_ms: 60_000,
            signal_floor_dbm: -80,
            strategy_timeout_ms: 3_000,
            channel_timeout_ms: 5_000,
            chunk_delay_ms: 100,
            universal_reliability_floor: 5.0,
        }
    }
}

impl DiscoveryConfig {
    /// Short timeouts for tests
    pub fn testing() -> Self {
        Self {
            strategy_timeout_ms: 200,
            channel_timeout_ms: 200,
            chunk_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.freshness_window_ms)
    }

    pub fn strategy_timeout(&self) -> Duration {
        Duration::from_millis(self.strategy_timeout_ms)
    }

    pub fn channel_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_timeout_ms)
    }

    pub fn chunk_delay(&self) -> Duration {
        Duration::from_millis(self.chunk_delay_ms)
    }
}

// ----------------------------------------------------------------------------
// Forwarder Configuration
// ----------------------------------------------------------------------------

/// Configuration for hop-by-hop forwarding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Forwarding stops once a packet's hop count reaches this value
    pub max_hops: u8,
    /// Lifetime of freshly originated packets
    pub message_ttl_ms: u64,
    /// How long message ids stay in the dedup set
    pub dedup_window_ms: u64,
    /// Pending packets older than this are dropped
    pub pending_max_age_ms: u64,
    /// Pending packets are dropped once this many retries failed
    pub pending_max_retries: u32,
    /// Interval of the pending-queue sweep
    pub pending_sweep_interval_ms: u64,
    /// Learned multi-hop routes older than this are forgotten
    pub route_max_age_ms: u64,
    /// Tell software-capable neighbours about our own neighbours
    pub route_adverts: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            max_hops: 10,
            message_ttl_ms: 30 * 60 * 1000,
            dedup_window_ms: 30 * 60 * 1000,
            pending_max_age_ms: 30 * 60 * 1000,
            pending_max_retries: 5,
            pending_sweep_interval_ms: 10_000,
            route_max_age_ms: 5 * 60 * 1000,
            route_adverts: true,
        }
    }
}

impl ForwarderConfig {
    /// Short intervals for tests
    pub fn testing() -> Self {
        Self {
            pending_sweep_interval_ms: 50,
            ..Self::default()
        }
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_millis(self.message_ttl_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }

    pub fn pending_max_age(&self) -> Duration {
        Duration::from_millis(self.pending_max_age_ms)
    }

    pub fn pending_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.pending_sweep_interval_ms)
    }

    pub fn route_max_age(&self) -> Duration {
        Duration::from_millis(self.route_max_age_ms)
    }
}

// ----------------------------------------------------------------------------
// Router Configuration
// ----------------------------------------------------------------------------

/// Configuration for the smart router and its background loops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Upper bound on waiting for route discovery replies
    pub discovery_timeout_ms: u64,
    /// Interval of the queued-message retry loop
    pub retry_interval_ms: u64,
    /// Queued messages are dropped after this many failed retries
    pub max_attempts: u32,
    /// Queued messages older than this are dropped
    pub max_message_age_ms: u64,
    /// Interval of the cached-route refresh loop
    pub route_refresh_interval_ms: u64,
    /// Delay between the two stages of a hybrid route
    pub hybrid_stage_delay_ms: u64,
    /// Wait for the first hop's relay acknowledgement before stage two
    pub require_relay_ack: bool,
    /// Cap on capable x generic pairings considered for hybrid routes
    pub max_hybrid_pairs: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: 15_000,
            retry_interval_ms: 2_000,
            max_attempts: 5,
            max_message_age_ms: 30 * 60 * 1000,
            route_refresh_interval_ms: 30_000,
            hybrid_stage_delay_ms: 1_000,
            require_relay_ack: false,
            max_hybrid_pairs: 16,
        }
    }
}

impl RouterConfig {
    /// Short intervals for tests
    pub fn testing() -> Self {
        Self {
            discovery_timeout_ms: 300,
            retry_interval_ms: 50,
            route_refresh_interval_ms: 100,
            hybrid_stage_delay_ms: 10,
            ..Self::default()
        }
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn max_message_age(&self) -> Duration {
        Duration::from_millis(self.max_message_age_ms)
    }

    pub fn route_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.route_refresh_interval_ms)
    }

    pub fn hybrid_stage_delay(&self) -> Duration {
        Duration::from_millis(self.hybrid_stage_delay_ms)
    }
}

// ----------------------------------------------------------------------------
// Top-Level Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for a relay node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub discovery: DiscoveryConfig,
    pub forwarder: ForwarderConfig,
    pub router: RouterConfig,
}

impl RelayConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration tuned for fast, deterministic tests
    pub fn testing() -> Self {
        Self {
            discovery: DiscoveryConfig::testing(),
            forwarder: ForwarderConfig::testing(),
            router: RouterConfig::testing(),
        }
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_forwarder(mut self, forwarder: ForwarderConfig) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn with_router(mut self, router: RouterConfig) -> Self {
        self.router = router;
        self
    }

    /// Reject configurations the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.forwarder.max_hops == 0 {
            return Err(RelayError::config_error("max_hops must be at least 1"));
        }
        if self.forwarder.pending_max_retries == 0 || self.router.max_attempts == 0 {
            return Err(RelayError::config_error("retry budgets must be at least 1"));
        }
        if !(0.0..=10.0).contains(&self.discovery.universal_reliability_floor) {
            return Err(RelayError::config_error(
                "universal_reliability_floor must be within [0, 10]",
            ));
        }
        let intervals = [
            ("pending_sweep_interval_ms", self.forwarder.pending_sweep_interval_ms),
            ("retry_interval_ms", self.router.retry_interval_ms),
            ("route_refresh_interval_ms", self.router.route_refresh_interval_ms),
            ("strategy_timeout_ms", self.discovery.strategy_timeout_ms),
            ("channel_timeout_ms", self.discovery.channel_timeout_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(RelayError::config_error(format!("{} must be non-zero", name)));
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
