//! Mesh scenarios over the simulated medium
//!
//! A scenario file lists engine nodes, generic devices, links between them,
//! injected failures and the messages to route. Running it starts one
//! runtime per node on a shared `VirtualAir`, sends the messages in order
//! and reports what each node routed, delivered and counted.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use bitrelay_core::capability::{
    BATTERY_SERVICE, DEVICE_INFORMATION_SERVICE, DISCOVERY_SERVICE, EDDYSTONE_SERVICE,
    GENERIC_ACCESS_SERVICE, GENERIC_RELAY_SERVICE, HEART_RATE_SERVICE, MESSAGE_SERVICE,
    NORDIC_UART_SERVICE,
};
use bitrelay_core::{AdvertisedHints, PeerId, RelayConfig};
use bitrelay_harness::VirtualAir;
use bitrelay_runtime::{RelayRuntime, RoutingResult, RoutingStatistics, RuntimeBuilder};
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SimulationConfig;
use crate::error::{CliError, Result};

// ----------------------------------------------------------------------------
// Scenario Description
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub name: String,
    pub nodes: Vec<NodeDef>,
    pub devices: Vec<DeviceDef>,
    pub links: Vec<LinkDef>,
    pub failures: Vec<FailureDef>,
    pub messages: Vec<MessageDef>,
}

/// A node running the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Wait for relay acknowledgements on hybrid routes
    #[serde(default)]
    pub require_relay_ack: bool,
}

/// A device that does not run the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
    /// Manufacturer data as `COMPANY:HEX`
    #[serde(default)]
    pub manufacturer: Option<String>,
    /// Pass anything written to it on to its other neighbours
    #[serde(default)]
    pub rebroadcast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkDef {
    pub a: String,
    pub b: String,
    #[serde(default = "default_signal")]
    pub signal: i16,
}

fn default_signal() -> i16 {
    -60
}

/// Failure injected before messages are sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureDef {
    pub from: String,
    /// Channel opens towards this peer fail
    #[serde(default)]
    pub to: Option<String>,
    /// Transfers with this strategy label fail
    #[serde(default)]
    pub strategy: Option<String>,
    /// The whole radio is switched off
    #[serde(default)]
    pub radio_off: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDef {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub hex: Option<String>,
    /// Pause before this message is sent
    #[serde(default)]
    pub delay_ms: u64,
}

impl MessageDef {
    pub fn payload(&self) -> Result<Vec<u8>> {
        match (&self.text, &self.hex) {
            (Some(text), None) => Ok(text.as_bytes().to_vec()),
            (None, Some(hex)) => Ok(hex::decode(hex)?),
            _ => Err(CliError::Scenario(format!(
                "message {} -> {} needs exactly one of text or hex",
                self.from, self.to
            ))),
        }
    }
}

impl FromStr for Scenario {
    type Err = CliError;

    fn from_str(text: &str) -> Result<Self> {
        let scenario: Scenario = toml::from_str(text)?;
        scenario.validate()?;
        Ok(scenario)
    }
}

impl Scenario {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        text.parse()
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(CliError::Scenario("at least one node is required".into()));
        }
        let mut ids: Vec<&str> = Vec::new();
        for id in self
            .nodes
            .iter()
            .map(|node| node.id.as_str())
            .chain(self.devices.iter().map(|device| device.id.as_str()))
        {
            if ids.contains(&id) {
                return Err(CliError::Scenario(format!("duplicate id {}", id)));
            }
            ids.push(id);
        }
        for link in &self.links {
            for end in [&link.a, &link.b] {
                if !ids.contains(&end.as_str()) {
                    return Err(CliError::Scenario(format!("link to unknown id {}", end)));
                }
            }
        }
        for message in &self.messages {
            if !self.nodes.iter().any(|node| node.id == message.from) {
                return Err(CliError::Scenario(format!(
                    "message sender {} is not a node",
                    message.from
                )));
            }
            message.payload()?;
        }
        for device in &self.devices {
            device_hints(device)?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Hint Parsing
// ----------------------------------------------------------------------------

/// Resolve a well-known service name or a literal UUID
pub fn parse_service(value: &str) -> Result<Uuid> {
    let service = match value.to_ascii_lowercase().replace('-', "_").as_str() {
        "message" => MESSAGE_SERVICE,
        "discovery" => DISCOVERY_SERVICE,
        "generic_relay" => GENERIC_RELAY_SERVICE,
        "nordic_uart" | "uart" => NORDIC_UART_SERVICE,
        "heart_rate" => HEART_RATE_SERVICE,
        "battery" => BATTERY_SERVICE,
        "device_information" => DEVICE_INFORMATION_SERVICE,
        "generic_access" => GENERIC_ACCESS_SERVICE,
        "eddystone" => EDDYSTONE_SERVICE,
        _ => Uuid::parse_str(value)
            .map_err(|e| CliError::InvalidArgument(format!("service {}: {}", value, e)))?,
    };
    Ok(service)
}

/// Parse `PREFIX:HEX` into its prefix and decoded bytes
pub fn parse_tagged_hex(value: &str) -> Result<(&str, Vec<u8>)> {
    let (tag, data) = value
        .split_once(':')
        .ok_or_else(|| CliError::InvalidArgument(format!("expected TAG:HEX, got {}", value)))?;
    Ok((tag, hex::decode(data)?))
}

pub fn parse_company_id(value: &str) -> Result<u16> {
    let trimmed = value.trim_start_matches("0x");
    u16::from_str_radix(trimmed, 16)
        .map_err(|e| CliError::InvalidArgument(format!("company id {}: {}", value, e)))
}

fn device_hints(device: &DeviceDef) -> Result<AdvertisedHints> {
    let mut hints = AdvertisedHints::new();
    if let Some(name) = &device.name {
        hints = hints.with_name(name);
    }
    for service in &device.services {
        hints = hints.with_service(parse_service(service)?);
    }
    if let Some(manufacturer) = &device.manufacturer {
        let (company, data) = parse_tagged_hex(manufacturer)?;
        hints = hints.with_manufacturer_data(parse_company_id(company)?, data);
    }
    Ok(hints)
}

// ----------------------------------------------------------------------------
// Report
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub name: String,
    pub messages: Vec<MessageReport>,
    pub nodes: BTreeMap<String, NodeReport>,
    pub transfers: usize,
    pub channel_opens: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageReport {
    pub from: String,
    pub to: String,
    pub outcome: String,
    pub message_id: Option<Uuid>,
    pub route: Option<String>,
    pub hops: Vec<String>,
    pub error: Option<String>,
}

impl MessageReport {
    fn new(message: &MessageDef, result: &RoutingResult) -> Self {
        let mut report = Self {
            from: message.from.clone(),
            to: message.to.clone(),
            outcome: String::new(),
            message_id: result.message_id(),
            route: None,
            hops: Vec::new(),
            error: None,
        };
        match result {
            RoutingResult::Success { route, .. } => {
                report.outcome = "success".into();
                report.route = Some(route.kind.to_string());
                report.hops = route.hops.iter().map(ToString::to_string).collect();
            }
            RoutingResult::Queued { .. } => report.outcome = "queued".into(),
            RoutingResult::NoRouteFound { .. } => report.outcome = "no-route".into(),
            RoutingResult::Error(e) => {
                report.outcome = "error".into();
                report.error = Some(e.to_string());
            }
        }
        report
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub received: Vec<ReceivedReport>,
    pub statistics: RoutingStatistics,
    pub pending: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReceivedReport {
    pub source: String,
    pub hop_count: u8,
    pub payload_hex: String,
    pub text: Option<String>,
}

// ----------------------------------------------------------------------------
// Runner
// ----------------------------------------------------------------------------

/// Runs a scenario end to end
pub struct ScenarioRunner {
    relay: RelayConfig,
    simulation: SimulationConfig,
}

impl ScenarioRunner {
    pub fn new(relay: RelayConfig, simulation: SimulationConfig) -> Self {
        Self { relay, simulation }
    }

    pub async fn run(&self, scenario: &Scenario) -> Result<ScenarioReport> {
        info!(
            "Running scenario '{}' with {} nodes and {} devices",
            scenario.name,
            scenario.nodes.len(),
            scenario.devices.len()
        );
        let air = VirtualAir::new(self.simulation.air_config());

        for device in &scenario.devices {
            air.add_generic_device(&device.id, device_hints(device)?, device.rebroadcast);
        }
        for link in &scenario.links {
            air.link(&link.a, &link.b, link.signal);
        }

        let mut runtimes: Vec<(String, RelayRuntime)> = Vec::new();
        for node in &scenario.nodes {
            let mut config = self.relay.clone();
            config.router.require_relay_ack |= node.require_relay_ack;
            let runtime = RuntimeBuilder::new(air.radio(&node.id))
                .with_config(config)
                .with_display_name(node.name.clone().unwrap_or_else(|| node.id.clone()))
                .build_and_start()
                .await?;
            runtimes.push((node.id.clone(), runtime));
        }

        let mut inboxes = Vec::new();
        for (id, runtime) in &runtimes {
            match runtime.take_message_receiver() {
                Some(inbox) => inboxes.push((id.clone(), inbox)),
                None => warn!("Message receiver for {} already taken", id),
            }
        }

        for failure in &scenario.failures {
            apply_failure(&air, failure)?;
        }

        debug!("Letting nodes discover each other for {:?}", self.simulation.settle());
        sleep(self.simulation.settle()).await;

        let mut messages = Vec::new();
        for message in &scenario.messages {
            if message.delay_ms > 0 {
                sleep(std::time::Duration::from_millis(message.delay_ms)).await;
            }
            let Some((_, runtime)) = runtimes.iter().find(|(id, _)| *id == message.from) else {
                return Err(CliError::Scenario(format!("unknown sender {}", message.from)));
            };
            let result = runtime
                .route_message(message.payload()?, PeerId::new(message.to.clone()))
                .await;
            info!("{} -> {}: {:?}", message.from, message.to, result);
            messages.push(MessageReport::new(message, &result));
        }

        sleep(self.simulation.drain()).await;

        let mut nodes = BTreeMap::new();
        for (id, runtime) in &runtimes {
            let mut received = Vec::new();
            if let Some((_, inbox)) = inboxes.iter_mut().find(|(inbox_id, _)| inbox_id == id) {
                while let Ok(message) = inbox.try_recv() {
                    received.push(ReceivedReport {
                        source: message.source.to_string(),
                        hop_count: message.hop_count,
                        payload_hex: hex::encode(&message.payload),
                        text: String::from_utf8(message.payload).ok(),
                    });
                }
            }
            nodes.insert(
                id.clone(),
                NodeReport {
                    received,
                    statistics: runtime.statistics().await,
                    pending: runtime.router().pending_messages().await.len(),
                },
            );
        }

        let report = ScenarioReport {
            name: scenario.name.clone(),
            messages,
            nodes,
            transfers: air.transfers().len(),
            channel_opens: air.channel_opens(),
        };

        for (id, mut runtime) in runtimes {
            if let Err(e) = runtime.shutdown().await {
                warn!("Node {} did not shut down cleanly: {}", id, e);
            }
        }
        Ok(report)
    }
}

fn apply_failure(air: &VirtualAir, failure: &FailureDef) -> Result<()> {
    if failure.radio_off {
        air.disable_radio(&failure.from);
    }
    if let Some(to) = &failure.to {
        air.fail_link(&failure.from, to);
    }
    if let Some(strategy) = &failure.strategy {
        let label = strategy_label(strategy).ok_or_else(|| {
            CliError::Scenario(format!("unknown strategy label {}", strategy))
        })?;
        air.fail_strategy(&failure.from, label);
    }
    Ok(())
}

/// Map a user-supplied label onto the static strategy labels
fn strategy_label(value: &str) -> Option<&'static str> {
    [
        "structured-channel",
        "identifier-encoding",
        "manufacturer-data",
        "service-data",
        "broadcast-chunking",
    ]
    .into_iter()
    .find(|label| *label == value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliConfig;

    const LINE: &str = r#"
        name = "line"

        [[nodes]]
        id = "A"

        [[nodes]]
        id = "B"

        [[nodes]]
        id = "C"

        [[links]]
        a = "A"
        b = "B"
        signal = -50

        [[links]]
        a = "B"
        b = "C"
        signal = -50

        [[messages]]
        from = "A"
        to = "C"
        text = "over the hill"
    "#;

    #[test]
    fn test_parse_scenario() {
        let scenario: Scenario = LINE.parse().unwrap();
        assert_eq!(scenario.name, "line");
        assert_eq!(scenario.nodes.len(), 3);
        assert_eq!(scenario.links[0].signal, -50);
        assert_eq!(scenario.messages[0].payload().unwrap(), b"over the hill".to_vec());
    }

    #[test]
    fn test_scenario_validation() {
        assert!("name = \"empty\"".parse::<Scenario>().is_err());

        let unknown_link = r#"
            [[nodes]]
            id = "A"
            [[links]]
            a = "A"
            b = "Z"
        "#;
        assert!(unknown_link.parse::<Scenario>().is_err());

        let both_payloads = r#"
            [[nodes]]
            id = "A"
            [[messages]]
            from = "A"
            to = "B"
            text = "x"
            hex = "00"
        "#;
        assert!(both_payloads.parse::<Scenario>().is_err());
    }

    #[test]
    fn test_parse_service_names_and_uuids() {
        assert_eq!(parse_service("heart_rate").unwrap(), HEART_RATE_SERVICE);
        assert_eq!(parse_service("Nordic-UART").unwrap(), NORDIC_UART_SERVICE);
        assert_eq!(
            parse_service("0000180f-0000-1000-8000-00805f9b34fb").unwrap(),
            BATTERY_SERVICE
        );
        assert!(parse_service("not-a-service").is_err());
    }

    #[test]
    fn test_parse_manufacturer_data() {
        let (company, data) = parse_tagged_hex("004c:0215").unwrap();
        assert_eq!(parse_company_id(company).unwrap(), 0x004C);
        assert_eq!(data, vec![0x02, 0x15]);
        assert!(parse_tagged_hex("004c").is_err());
    }

    #[tokio::test]
    async fn test_run_line_scenario() {
        let scenario: Scenario = LINE.parse().unwrap();
        let config = CliConfig::default();
        let runner = ScenarioRunner::new(config.relay, config.simulation);

        let report = runner.run(&scenario).await.unwrap();
        assert_eq!(report.messages.len(), 1);
        assert_eq!(report.messages[0].outcome, "success");

        let c = &report.nodes["C"];
        assert_eq!(c.received.len(), 1);
        assert_eq!(c.received[0].source, "A");
        assert_eq!(c.received[0].hop_count, 2);
        assert_eq!(c.received[0].text.as_deref(), Some("over the hill"));
    }
}
