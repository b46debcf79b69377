//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a mesh scenario described in a TOML file over the simulated medium
    Simulate {
        /// Scenario file
        scenario: PathBuf,
    },
    /// Classify and score a single sighting
    Score {
        /// Advertised local name
        #[arg(short, long)]
        name: Option<String>,
        /// Advertised service: a well-known name (heart_rate, battery, ...) or a UUID
        #[arg(short, long = "service")]
        services: Vec<String>,
        /// Manufacturer data as COMPANY:HEX, e.g. 004c:0215
        #[arg(short, long)]
        manufacturer: Option<String>,
        /// Service data as SERVICE:HEX
        #[arg(long)]
        service_data: Option<String>,
        /// Received signal strength in dBm
        #[arg(long, default_value_t = -60, allow_hyphen_values = true)]
        signal: i16,
    },
    /// Print the effective configuration as TOML
    Config,
}
