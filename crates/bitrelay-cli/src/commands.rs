//! Command handlers for the BitRelay CLI

use bitrelay_core::{classify, reliability_score, AdvertisedHints, TransportStrategy};
use serde::Serialize;
use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::CliConfig;
use crate::error::Result;
use crate::scenario::{
    parse_company_id, parse_service, parse_tagged_hex, Scenario, ScenarioReport, ScenarioRunner,
};

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: CliConfig) -> Result<()> {
        match cli.command {
            Commands::Simulate { scenario } => {
                let scenario = Scenario::load(&scenario)?;
                let runner = ScenarioRunner::new(config.relay, config.simulation);
                let report = runner.run(&scenario).await?;
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print_report(&report);
                }
                Ok(())
            }
            Commands::Score {
                name,
                services,
                manufacturer,
                service_data,
                signal,
            } => {
                let hints = build_hints(name, &services, manufacturer, service_data)?;
                let score = ScoreReport::new(&hints, signal);
                if cli.json {
                    println!("{}", serde_json::to_string_pretty(&score)?);
                } else {
                    println!("capability:  {}", score.capability);
                    println!("strategies:  {}", score.strategies.join(", "));
                    println!("score:       {:.2}", score.reliability_score);
                }
                Ok(())
            }
            Commands::Config => {
                print!("{}", config.to_toml()?);
                Ok(())
            }
        }
    }
}

fn build_hints(
    name: Option<String>,
    services: &[String],
    manufacturer: Option<String>,
    service_data: Option<String>,
) -> Result<AdvertisedHints> {
    let mut hints = AdvertisedHints::new();
    if let Some(name) = name {
        hints = hints.with_name(&name);
    }
    for service in services {
        hints = hints.with_service(parse_service(service)?);
    }
    if let Some(manufacturer) = manufacturer {
        let (company, data) = parse_tagged_hex(&manufacturer)?;
        hints = hints.with_manufacturer_data(parse_company_id(company)?, data);
    }
    if let Some(service_data) = service_data {
        let (service, data) = parse_tagged_hex(&service_data)?;
        hints = hints.with_service_data(parse_service(service)?, data);
    }
    Ok(hints)
}

/// Classification and score of one sighting
#[derive(Debug, Serialize)]
struct ScoreReport {
    capability: String,
    strategies: Vec<&'static str>,
    reliability_score: f32,
}

impl ScoreReport {
    fn new(hints: &AdvertisedHints, signal_strength: i16) -> Self {
        let (capability, strategies) = classify(hints);
        info!(
            "Classified sighting as {:?} with {} strategies",
            capability,
            strategies.len()
        );
        Self {
            capability: format!("{:?}", capability),
            strategies: strategies.iter().map(TransportStrategy::label).collect(),
            reliability_score: reliability_score(&strategies, signal_strength),
        }
    }
}

fn print_report(report: &ScenarioReport) {
    println!("Scenario: {}", report.name);
    println!();
    for message in &report.messages {
        let route = match &message.route {
            Some(kind) => format!(" via {} [{}]", kind, message.hops.join(" -> ")),
            None => String::new(),
        };
        let error = message
            .error
            .as_ref()
            .map(|e| format!(" ({})", e))
            .unwrap_or_default();
        println!(
            "  {} -> {}: {}{}{}",
            message.from, message.to, message.outcome, route, error
        );
    }
    println!();
    for (id, node) in &report.nodes {
        let stats = &node.statistics;
        println!(
            "  {}: received {}, sent {}/{}, queued {}, pending {}, relayed {}, duplicates {}",
            id,
            node.received.len(),
            stats.successful_messages,
            stats.total_messages,
            stats.queued_messages,
            node.pending,
            stats.forwarder.relayed,
            stats.forwarder.duplicates
        );
        for received in &node.received {
            let body = received
                .text
                .clone()
                .unwrap_or_else(|| received.payload_hex.clone());
            println!(
                "      from {} after {} hops: {}",
                received.source, received.hop_count, body
            );
        }
    }
    println!();
    println!(
        "  medium: {} transfers, {} channel opens",
        report.transfers, report.channel_opens
    );
}
