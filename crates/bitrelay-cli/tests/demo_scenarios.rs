//! The scenario and configuration files shipped under `demos/` stay valid

use std::path::PathBuf;

use bitrelay_cli::{CliConfig, Scenario, ScenarioRunner};

fn demo(file: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("../../demos")
        .join(file)
}

#[test]
fn test_demo_files_parse() {
    for file in ["mixed_mesh.toml", "broken_link.toml"] {
        let scenario = Scenario::load(demo(file)).unwrap();
        assert!(!scenario.nodes.is_empty(), "{} has no nodes", file);
    }
    let config = CliConfig::load_from_file(demo("bitrelay.toml")).unwrap();
    assert!(config.relay.router.require_relay_ack);
}

#[tokio::test]
async fn test_broken_link_demo_queues_then_drops() {
    let scenario = Scenario::load(demo("broken_link.toml")).unwrap();
    let mut config = CliConfig::default();
    config.simulation.settle_ms = 300;
    let runner = ScenarioRunner::new(config.relay, config.simulation);

    let report = runner.run(&scenario).await.unwrap();
    assert_eq!(report.messages[0].outcome, "queued");

    let a = &report.nodes["A"];
    assert_eq!(a.pending, 0);
    assert_eq!(a.statistics.queued_messages, 1);
    assert_eq!(a.statistics.dropped_messages, 1);
}
