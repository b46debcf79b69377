//! BitRelay CLI library
//!
//! Command-line parsing, configuration loading and the scenario runner
//! behind the `bitrelay` binary.

pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod scenario;

pub use cli::{Cli, Commands};
pub use commands::CommandDispatcher;
pub use config::{CliConfig, SimulationConfig};
pub use error::{CliError, Result};
pub use scenario::{Scenario, ScenarioReport, ScenarioRunner};
