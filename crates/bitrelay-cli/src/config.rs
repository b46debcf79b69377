//! BitRelay CLI Configuration Management
//!
//! The CLI drives simulated meshes, so its defaults use the engine's short
//! `testing()` intervals. A configuration file only needs the keys it wants
//! to change: the file is layered over the defaults table by table before
//! deserializing, so `[relay.router]` with one key keeps every other router
//! default.

use std::path::Path;
use std::time::Duration;

use bitrelay_core::RelayConfig;
use bitrelay_harness::AirConfig;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// CLI Configuration
// ----------------------------------------------------------------------------

/// Complete configuration for the BitRelay CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Engine configuration applied to every simulated node
    pub relay: RelayConfig,
    /// Simulated medium and scenario pacing
    pub simulation: SimulationConfig,
}

/// Behaviour of the simulated medium and scenario pacing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Pause between scan rounds on every simulated radio
    pub scan_interval_ms: u64,
    /// Probability that a single transfer is lost
    pub loss_rate: f64,
    /// Delay applied to every delivered frame
    pub latency_ms: u64,
    /// Time given to nodes to discover each other before messages are sent
    pub settle_ms: u64,
    /// Time given to in-flight messages after the last send
    pub drain_ms: u64,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            relay: RelayConfig::testing(),
            simulation: SimulationConfig::default(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: 50,
            loss_rate: 0.0,
            latency_ms: 0,
            settle_ms: 500,
            drain_ms: 1_000,
        }
    }
}

impl SimulationConfig {
    pub fn air_config(&self) -> AirConfig {
        AirConfig {
            loss_rate: self.loss_rate,
            scan_interval: Duration::from_millis(self.scan_interval_ms),
            latency: Duration::from_millis(self.latency_ms),
        }
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn drain(&self) -> Duration {
        Duration::from_millis(self.drain_ms)
    }
}

impl CliConfig {
    /// Load a configuration file layered over the defaults
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            CliError::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        debug!("Loaded configuration text from {}", path.as_ref().display());
        Self::from_toml(&text)
    }

    /// Parse TOML text layered over the defaults
    pub fn from_toml(text: &str) -> Result<Self> {
        let overrides: toml::Value = toml::from_str(text)?;
        let mut merged = toml::Value::try_from(Self::default())?;
        merge(&mut merged, overrides);
        let config: CliConfig = merged.try_into()?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.relay.validate()?;
        if !(0.0..=1.0).contains(&self.simulation.loss_rate) {
            return Err(CliError::Config(
                "simulation.loss_rate must be within [0, 1]".to_string(),
            ));
        }
        if self.simulation.scan_interval_ms == 0 {
            return Err(CliError::Config(
                "simulation.scan_interval_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Overlay `overrides` onto `base`, descending into tables
fn merge(base: &mut toml::Value, overrides: toml::Value) {
    match (base, overrides) {
        (toml::Value::Table(base), toml::Value::Table(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, value) => *base = value,
    }
}
