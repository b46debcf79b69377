//! Integration tests for relay nodes on the simulated radio medium
//!
//! Every node runs a full runtime (scan, inbound, refresh, sweep and retry
//! tasks) over a shared `VirtualAir`, unless the test feeds sightings in by
//! hand.

use std::time::Duration;

use bitrelay_core::capability::HEART_RATE_SERVICE;
use bitrelay_core::{AdvertisedHints, Frame, MeshPacket, Timestamp};
use bitrelay_harness::{AirConfig, VirtualAir};
use bitrelay_runtime::{
    PeerId, RelayConfig, RelayRuntime, RouteKind, RoutingResult, RoutingStatus, RuntimeBuilder,
    Sighting,
};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(3);

fn quiet_config() -> RelayConfig {
    let mut config = RelayConfig::testing();
    config.forwarder.route_adverts = false;
    config
}

async fn start(air: &VirtualAir, id: &str) -> RelayRuntime {
    start_with(air, id, RelayConfig::testing()).await
}

async fn start_with(air: &VirtualAir, id: &str, config: RelayConfig) -> RelayRuntime {
    RuntimeBuilder::new(air.radio(id))
        .with_config(config)
        .with_display_name(id)
        .build_and_start()
        .await
        .expect("runtime starts")
}

async fn start_manual(air: &VirtualAir, id: &str) -> RelayRuntime {
    RuntimeBuilder::new(air.radio(id))
        .with_config(quiet_config())
        .without_scanner()
        .build_and_start()
        .await
        .expect("runtime starts")
}

async fn wait_for_peer(runtime: &RelayRuntime, peer: &str) {
    let peer = PeerId::new(peer);
    for _ in 0..150 {
        let peers = runtime.forwarder().viable_peers().await;
        if peers.iter().any(|known| known.peer_id == peer) {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("{} never saw {}", runtime.local_id(), peer);
}

/// Poll a counter until it reaches `expected`, then assert it stays exact
async fn wait_for_count(read: impl Fn() -> u64, expected: u64) {
    for _ in 0..150 {
        if read() >= expected {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(read(), expected);
}

fn software(id: &str, signal: i16) -> Sighting {
    Sighting::new(id, AdvertisedHints::software(id), signal)
}

fn heart_rate_strap(id: &str, signal: i16) -> Sighting {
    Sighting::new(
        id,
        AdvertisedHints::new().with_service(HEART_RATE_SERVICE),
        signal,
    )
}

// ----------------------------------------------------------------------------
// Delivery
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_direct_delivery_between_neighbours() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.link("A", "B", -50);
    let mut a = start(&air, "A").await;
    let mut b = start(&air, "B").await;
    let mut inbox = b.take_message_receiver().expect("receiver available");

    wait_for_peer(&a, "B").await;
    let result = a.route_message(b"hello".to_vec(), PeerId::new("B")).await;
    match &result {
        RoutingResult::Success { route, .. } => assert_eq!(route.kind, RouteKind::DirectCapable),
        other => panic!("expected success, got {:?}", other),
    }

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload, b"hello".to_vec());
    assert_eq!(message.source, PeerId::new("A"));
    assert_eq!(message.hop_count, 1);
    assert_eq!(Some(message.message_id), result.message_id());

    let stats = a.statistics().await;
    assert_eq!(stats.total_messages, 1);
    assert_eq!(stats.successful_messages, 1);
    assert_eq!(stats.route_type_counts[&RouteKind::DirectCapable], 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    assert!(!a.is_running());
}

#[tokio::test]
async fn test_multi_hop_delivery_through_capable_peer() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.link("A", "B", -50);
    air.link("B", "C", -55);
    let mut a = start(&air, "A").await;
    let mut b = start(&air, "B").await;
    let mut c = start(&air, "C").await;
    let mut inbox = c.take_message_receiver().unwrap();

    wait_for_peer(&a, "B").await;
    wait_for_peer(&b, "C").await;

    let result = a.route_message(b"two hops".to_vec(), PeerId::new("C")).await;
    assert!(result.is_success(), "got {:?}", result);

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload, b"two hops".to_vec());
    assert_eq!(message.source, PeerId::new("A"));
    assert_eq!(message.hop_count, 2);
    wait_for_count(|| b.forwarder().statistics().relayed, 1).await;

    // C learned the way back to A through B
    let back = c.forwarder().routing_entry(&PeerId::new("A")).await.unwrap();
    assert_eq!(back.next_hop, PeerId::new("B"));

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_route_discovery_learns_mesh_path() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.link("A", "B", -50);
    air.link("B", "C", -50);
    let mut a = start_with(&air, "A", quiet_config()).await;
    let mut b = start_with(&air, "B", quiet_config()).await;
    let mut c = start_with(&air, "C", quiet_config()).await;

    wait_for_peer(&a, "B").await;
    wait_for_peer(&b, "C").await;

    let found = a.router().discover_routes(&PeerId::new("C")).await;
    assert!(found >= 1);

    let entry = a.forwarder().routing_entry(&PeerId::new("C")).await.unwrap();
    assert_eq!(entry.next_hop, PeerId::new("B"));
    assert_eq!(entry.hop_count, 2);
    assert_eq!(entry.path, vec![PeerId::new("B"), PeerId::new("C")]);

    let kinds: Vec<RouteKind> = a
        .router()
        .build_candidates(&PeerId::new("C"))
        .await
        .iter()
        .map(|route| route.kind)
        .collect();
    assert_eq!(kinds, vec![RouteKind::MeshHop]);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_route_message_discovers_path_before_neighbour_fallback() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.link("A", "B", -50);
    air.link("B", "C", -50);
    let mut a = start_with(&air, "A", quiet_config()).await;
    let mut b = start_with(&air, "B", quiet_config()).await;
    let mut c = start_with(&air, "C", quiet_config()).await;
    let mut inbox = c.take_message_receiver().unwrap();

    wait_for_peer(&a, "B").await;
    wait_for_peer(&b, "A").await;
    wait_for_peer(&b, "C").await;
    assert!(a.forwarder().routing_entry(&PeerId::new("C")).await.is_none());

    let result = a.route_message(b"find the way".to_vec(), PeerId::new("C")).await;
    match &result {
        RoutingResult::Success { route, .. } => {
            assert_eq!(route.kind, RouteKind::MeshHop);
            assert_eq!(route.hops.as_slice(), &[PeerId::new("B")]);
        }
        other => panic!("expected success, got {:?}", other),
    }

    let entry = a.forwarder().routing_entry(&PeerId::new("C")).await.unwrap();
    assert_eq!(entry.next_hop, PeerId::new("B"));
    assert_eq!(entry.hop_count, 2);

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload, b"find the way".to_vec());
    assert_eq!(message.hop_count, 2);
    assert_eq!(a.statistics().await.route_type_counts[&RouteKind::MeshHop], 1);

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_universal_relay_through_echoing_generic_device() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.add_generic_device(
        "STRAP",
        AdvertisedHints::new().with_service(HEART_RATE_SERVICE),
        true,
    );
    air.link("A", "STRAP", -45);
    air.link("STRAP", "T", -45);
    let mut a = start(&air, "A").await;
    let mut t = start(&air, "T").await;
    let mut inbox = t.take_message_receiver().unwrap();

    wait_for_peer(&a, "STRAP").await;

    let result = a.route_message(b"via strap".to_vec(), PeerId::new("T")).await;
    match &result {
        RoutingResult::Success { route, .. } => {
            assert_eq!(route.kind, RouteKind::UniversalRelay);
            assert_eq!(route.first_hop(), Some(&PeerId::new("STRAP")));
        }
        other => panic!("expected success, got {:?}", other),
    }

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload, b"via strap".to_vec());
    assert_eq!(message.source, PeerId::new("A"));

    a.shutdown().await.unwrap();
    t.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_hybrid_route_waits_for_relay_ack() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.add_generic_device(
        "STRAP",
        AdvertisedHints::new().with_service(HEART_RATE_SERVICE),
        true,
    );
    air.link("A", "C", -50);
    air.link("C", "T", -50);
    air.link("A", "STRAP", -45);
    air.link("STRAP", "T", -45);

    let mut config = quiet_config();
    config.router.require_relay_ack = true;
    let mut a = start_with(&air, "A", config).await;
    let mut c = start_with(&air, "C", quiet_config()).await;
    let mut t = start_with(&air, "T", quiet_config()).await;
    let mut inbox = t.take_message_receiver().unwrap();

    wait_for_peer(&a, "C").await;
    wait_for_peer(&a, "STRAP").await;
    wait_for_peer(&c, "T").await;

    let target = PeerId::new("T");
    let hybrid = a
        .router()
        .build_candidates(&target)
        .await
        .into_iter()
        .find(|route| route.kind == RouteKind::Hybrid)
        .expect("hybrid candidate");
    assert_eq!(hybrid.hops.as_slice(), &[PeerId::new("C"), PeerId::new("STRAP")]);

    let message_id = Uuid::new_v4();
    a.router()
        .attempt_route(message_id, &target, b"both stages", &hybrid)
        .await
        .expect("hybrid route succeeds once C acknowledges");

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.message_id, message_id);

    // The copy echoed by the strap is recognised as a duplicate
    wait_for_count(|| t.forwarder().statistics().duplicates, 1).await;
    let stats = t.forwarder().statistics();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.duplicates, 1);
    assert!(timeout(Duration::from_millis(100), inbox.recv()).await.is_err());

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
    t.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_optimistic_hybrid_sends_second_stage_after_delay() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.add_generic_device(
        "STRAP",
        AdvertisedHints::new().with_service(HEART_RATE_SERVICE),
        true,
    );
    air.link("A", "C", -50);
    air.link("C", "T", -50);
    air.link("A", "STRAP", -45);
    air.link("STRAP", "T", -45);

    let mut config = quiet_config();
    config.router.hybrid_stage_delay_ms = 150;
    let mut a = start_with(&air, "A", config).await;
    let mut c = start_with(&air, "C", quiet_config()).await;
    let mut t = start_with(&air, "T", quiet_config()).await;
    let mut inbox = t.take_message_receiver().unwrap();

    wait_for_peer(&a, "C").await;
    wait_for_peer(&a, "STRAP").await;
    wait_for_peer(&c, "T").await;

    let target = PeerId::new("T");
    let hybrid = a
        .router()
        .build_candidates(&target)
        .await
        .into_iter()
        .find(|route| route.kind == RouteKind::Hybrid)
        .expect("hybrid candidate");

    let started = std::time::Instant::now();
    a.router()
        .attempt_route(Uuid::new_v4(), &target, b"no ack needed", &hybrid)
        .await
        .expect("optimistic hybrid succeeds");
    assert!(started.elapsed() >= Duration::from_millis(150));

    let hops: Vec<PeerId> = air
        .transfers_from("A")
        .into_iter()
        .filter_map(|record| record.to)
        .collect();
    let to_c = hops.iter().position(|hop| *hop == PeerId::new("C")).unwrap();
    let to_strap = hops.iter().position(|hop| *hop == PeerId::new("STRAP")).unwrap();
    assert!(to_c < to_strap);

    let message = timeout(WAIT, inbox.recv()).await.unwrap().unwrap();
    assert_eq!(message.payload, b"no ack needed".to_vec());
    wait_for_count(|| t.forwarder().statistics().duplicates, 1).await;
    assert_eq!(t.forwarder().statistics().delivered, 1);

    a.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
    t.shutdown().await.unwrap();
}

// ----------------------------------------------------------------------------
// Forwarding Limits
// ----------------------------------------------------------------------------

fn packet_held_by(holder: &str, hop_count: u8, ttl_deadline: Timestamp) -> MeshPacket {
    let mut route_taken: Vec<PeerId> = (0..hop_count)
        .map(|index| PeerId::new(format!("N{}", index)))
        .collect();
    route_taken.push(PeerId::new(holder));
    MeshPacket {
        message_id: Uuid::new_v4(),
        source: PeerId::new("N0"),
        target: PeerId::new("FAR"),
        payload: b"deep".to_vec(),
        hop_count,
        ttl_deadline,
        route_taken,
        flags: 0,
    }
}

#[tokio::test]
async fn test_hop_limit_stops_forwarding_after_tenth_hop() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.link("A", "B", -50);
    air.link("B", "C", -50);
    let mut a = start_with(&air, "A", quiet_config()).await;
    let mut b = start_with(&air, "B", quiet_config()).await;
    let mut c = start_with(&air, "C", quiet_config()).await;

    wait_for_peer(&a, "B").await;
    wait_for_peer(&b, "C").await;

    let packet = packet_held_by("A", 9, Timestamp::now() + Duration::from_secs(60));
    let bytes = Frame::Data(packet).encode().unwrap();
    assert!(air.inject("N8", "A", bytes));

    wait_for_count(|| b.forwarder().statistics().hop_limited, 1).await;
    wait_for_count(|| a.forwarder().statistics().relayed, 1).await;
    assert!(air.transfers_from("B").is_empty());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
    c.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_packet_is_dropped_even_with_next_hop() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.link("A", "B", -50);
    let mut a = start_with(&air, "A", quiet_config()).await;
    let mut b = start_with(&air, "B", quiet_config()).await;
    wait_for_peer(&a, "B").await;

    let deadline = Timestamp::new(Timestamp::now().as_millis() - 1_000);
    let bytes = Frame::Data(packet_held_by("A", 1, deadline)).encode().unwrap();
    assert!(air.inject("N0", "A", bytes));

    wait_for_count(|| a.forwarder().statistics().expired, 1).await;
    assert!(air.transfers_from("A").is_empty());

    a.shutdown().await.unwrap();
    b.shutdown().await.unwrap();
}

// ----------------------------------------------------------------------------
// Router Outcomes
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_no_known_peers_yields_no_route() {
    let air = VirtualAir::new(AirConfig::ideal());
    let mut a = start(&air, "A").await;

    let result = timeout(WAIT, a.route_message(b"anyone?".to_vec(), PeerId::new("GHOST")))
        .await
        .unwrap();
    assert!(matches!(result, RoutingResult::NoRouteFound { ref target } if *target == PeerId::new("GHOST")));
    assert_eq!(a.statistics().await.no_route_messages, 1);
    assert_eq!(a.status(), RoutingStatus::Idle);

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_capable_route_attempted_before_generic() {
    let air = VirtualAir::new(AirConfig::ideal());
    let _c_radio = air.radio("C");
    air.add_generic_device(
        "STRAP",
        AdvertisedHints::new().with_service(HEART_RATE_SERVICE),
        false,
    );
    air.link("A", "C", -60);
    air.link("A", "STRAP", -40);
    let mut a = start_manual(&air, "A").await;
    a.observe(&heart_rate_strap("STRAP", -40)).await.unwrap();
    a.observe(&software("C", -60)).await.unwrap();

    let result = a.route_message(b"first".to_vec(), PeerId::new("T")).await;
    match &result {
        RoutingResult::Success { route, .. } => {
            assert_eq!(route.kind, RouteKind::DirectCapable);
            assert_eq!(route.first_hop(), Some(&PeerId::new("C")));
        }
        other => panic!("expected success, got {:?}", other),
    }
    let first = &air.transfers_from("A")[0];
    assert_eq!(first.to, Some(PeerId::new("C")));

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_candidate_falls_back_in_priority_order() {
    let air = VirtualAir::new(AirConfig::ideal());
    let _c_radio = air.radio("C");
    air.add_generic_device(
        "STRAP",
        AdvertisedHints::new().with_service(HEART_RATE_SERVICE),
        false,
    );
    air.link("A", "C", -60);
    air.link("A", "STRAP", -40);
    air.fail_link("A", "C");
    let mut a = start_manual(&air, "A").await;
    a.observe(&heart_rate_strap("STRAP", -40)).await.unwrap();
    a.observe(&software("C", -60)).await.unwrap();

    let result = a.route_message(b"fallback".to_vec(), PeerId::new("T")).await;
    match &result {
        RoutingResult::Success { route, .. } => assert_eq!(route.kind, RouteKind::UniversalRelay),
        other => panic!("expected success, got {:?}", other),
    }
    // Failed route search to C, failed direct attempt, then the strap
    assert_eq!(air.channel_opens(), 3);
    let transfers = air.transfers_from("A");
    assert!(!transfers.is_empty());
    assert!(transfers
        .iter()
        .all(|record| record.to == Some(PeerId::new("STRAP"))));

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_message_is_purged_after_five_retries() {
    let air = VirtualAir::new(AirConfig::ideal());
    let _b_radio = air.radio("B");
    air.link("A", "B", -50);
    air.fail_link("A", "B");
    let mut a = start_manual(&air, "A").await;
    a.observe(&software("B", -50)).await.unwrap();

    let result = a.route_message(b"stuck".to_vec(), PeerId::new("Z")).await;
    assert!(matches!(result, RoutingResult::Queued { .. }), "got {:?}", result);
    assert_eq!(a.router().pending_messages().await.len(), 1);

    for _ in 0..150 {
        if a.router().pending_messages().await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(a.router().pending_messages().await.is_empty());

    // Route search, one initial attempt and five retries, then nothing more
    assert_eq!(air.channel_opens(), 7);
    sleep(Duration::from_millis(200)).await;
    assert_eq!(air.channel_opens(), 7);

    let stats = a.statistics().await;
    assert_eq!(stats.queued_messages, 1);
    assert_eq!(stats.dropped_messages, 1);
    assert_eq!(stats.successful_messages, 0);

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_withdrawn_message_is_not_retried() {
    let air = VirtualAir::new(AirConfig::ideal());
    let _b_radio = air.radio("B");
    air.link("A", "B", -50);
    air.fail_link("A", "B");
    let mut a = start_manual(&air, "A").await;
    a.observe(&software("B", -50)).await.unwrap();

    let result = a.route_message(b"never mind".to_vec(), PeerId::new("Z")).await;
    let message_id = result.message_id().expect("queued message has an id");
    assert!(a.withdraw(&message_id).await);
    assert!(!a.withdraw(&message_id).await);

    let opens = air.channel_opens();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(air.channel_opens(), opens);

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unavailable_radio_is_an_error_not_queued() {
    let air = VirtualAir::new(AirConfig::ideal());
    let _b_radio = air.radio("B");
    air.link("A", "B", -50);
    let mut a = start_manual(&air, "A").await;
    a.observe(&software("B", -50)).await.unwrap();
    air.disable_radio("A");

    let result = a.route_message(b"offline".to_vec(), PeerId::new("B")).await;
    match result {
        RoutingResult::Error(e) => assert!(e.is_transport_unavailable()),
        other => panic!("expected error, got {:?}", other),
    }
    assert!(a.router().pending_messages().await.is_empty());

    a.shutdown().await.unwrap();
}

// ----------------------------------------------------------------------------
// Diagnostics
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_relay_capable_devices_snapshot() {
    let air = VirtualAir::new(AirConfig::ideal());
    air.add_generic_device(
        "TRACKER",
        AdvertisedHints::new()
            .with_name("Fitness Tracker")
            .with_manufacturer_data(0x004C, vec![1, 2, 3]),
        false,
    );
    air.add_generic_device("WEAK", AdvertisedHints::software("weak"), false);
    air.link("A", "TRACKER", -60);
    air.link("A", "WEAK", -90);
    let mut a = start(&air, "A").await;

    wait_for_peer(&a, "TRACKER").await;
    let devices = a.discover_relay_capable_devices().await;
    assert_eq!(devices.len(), 1);
    let tracker = &devices[0];
    assert_eq!(tracker.peer_id, PeerId::new("TRACKER"));
    assert_eq!(tracker.name, "Fitness Tracker");
    assert_eq!(tracker.strategies.len(), 3);
    assert!((0.0..=10.0).contains(&tracker.reliability_score));

    a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_removes_peer_from_candidates() {
    let air = VirtualAir::new(AirConfig::ideal());
    let _b_radio = air.radio("B");
    air.link("A", "B", -50);
    let mut a = start_manual(&air, "A").await;
    air.connect("A", "B");

    for _ in 0..100 {
        if !a.forwarder().viable_peers().await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(a.router().build_candidates(&PeerId::new("B")).await.len(), 1);

    air.disconnect("A", "B");
    for _ in 0..100 {
        if a.forwarder().viable_peers().await.is_empty() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(a.router().build_candidates(&PeerId::new("B")).await.is_empty());

    a.shutdown().await.unwrap();
}
