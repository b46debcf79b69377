//! Property-based tests for next-hop selection
//!
//! Whatever mix of neighbours a node has and whichever of them a packet
//! already visited, forwarding never hands the packet back to a visited
//! peer.

use std::sync::Arc;
use std::time::Duration;

use bitrelay_core::{
    AdvertisedHints, DiscoveryConfig, ForwarderConfig, MeshPacket, PeerId, RadioLink, Sighting,
    SystemTimeSource, TimeSource, Timestamp,
};
use bitrelay_harness::{AirConfig, SimulatedRadio, VirtualAir};
use bitrelay_runtime::{CapabilityDiscoverer, MeshForwarder, PeerLocks, RelayOutcome};
use proptest::prelude::*;
use uuid::Uuid;

struct Neighbourhood {
    forwarder: MeshForwarder,
    // Keeps the neighbours' inbound channels open
    _radios: Vec<Arc<SimulatedRadio>>,
}

async fn neighbourhood(signals: &[i16]) -> Neighbourhood {
    let air = VirtualAir::new(AirConfig::ideal());
    let local = air.radio("ME");
    let radio: Arc<dyn RadioLink> = local;
    let time_source: Arc<dyn TimeSource> = Arc::new(SystemTimeSource);
    let discovery = DiscoveryConfig::testing();
    let discoverer = Arc::new(CapabilityDiscoverer::new(
        discovery.clone(),
        radio,
        Arc::clone(&time_source),
        Arc::new(PeerLocks::new()),
    ));
    let forwarder = MeshForwarder::new(
        PeerId::new("ME"),
        ForwarderConfig::testing(),
        discovery,
        time_source,
        Arc::clone(&discoverer),
    );

    let mut radios = Vec::new();
    for (index, signal) in signals.iter().enumerate() {
        let id = format!("P{}", index);
        radios.push(air.radio(&id));
        air.link("ME", &id, *signal);
        let sighting = Sighting::new(&id, AdvertisedHints::software(&id), *signal);
        if let Some(peer) = discoverer.observe(&sighting).await {
            forwarder.on_peer_seen(peer).await;
        }
    }

    Neighbourhood {
        forwarder,
        _radios: radios,
    }
}

fn held_packet(visited: &[PeerId]) -> MeshPacket {
    let mut packet = MeshPacket::new(
        PeerId::new("SRC"),
        PeerId::new("FAR"),
        b"property".to_vec(),
        Timestamp::now(),
        Duration::from_secs(60),
    );
    for peer in visited {
        packet.route_taken.push(peer.clone());
    }
    packet.route_taken.push(PeerId::new("ME"));
    packet.hop_count = (packet.route_taken.len() - 1) as u8;
    packet.message_id = Uuid::new_v4();
    packet
}

fn arb_neighbours() -> impl Strategy<Value = (Vec<i16>, Vec<bool>)> {
    prop::collection::vec(-79i16..=-30, 1..=5).prop_flat_map(|signals| {
        let len = signals.len();
        (Just(signals), prop::collection::vec(any::<bool>(), len))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: the chosen next hop is never already on the packet's route
    #[test]
    fn next_hop_is_never_a_visited_peer((signals, visited_mask) in arb_neighbours()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");

        let outcome = runtime.block_on(async {
            let hood = neighbourhood(&signals).await;
            let visited: Vec<PeerId> = visited_mask
                .iter()
                .enumerate()
                .filter(|(_, visited)| **visited)
                .map(|(index, _)| PeerId::new(format!("P{}", index)))
                .collect();
            let packet = held_packet(&visited);
            let outcome = hood.forwarder.relay(packet.clone()).await;
            (outcome, packet)
        });

        let (outcome, packet) = outcome;
        let all_visited = visited_mask.iter().all(|visited| *visited);
        match outcome {
            RelayOutcome::Sent { next_hop } => {
                prop_assert!(!all_visited);
                prop_assert!(!packet.has_visited(&next_hop));
                prop_assert!(next_hop.as_str().starts_with('P'));
            }
            RelayOutcome::Queued => prop_assert!(all_visited),
            other => prop_assert!(false, "unexpected outcome {:?}", other),
        }
    }

    /// Property: a packet at the hop limit is dropped whatever the neighbourhood
    #[test]
    fn hop_limit_always_wins((signals, _mask) in arb_neighbours()) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");

        let (outcome, hop_limited) = runtime.block_on(async {
            let hood = neighbourhood(&signals).await;
            let mut packet = held_packet(&[]);
            packet.hop_count = ForwarderConfig::default().max_hops;
            let outcome = hood.forwarder.relay(packet).await;
            (outcome, hood.forwarder.statistics().hop_limited)
        });

        prop_assert!(matches!(outcome, RelayOutcome::Dropped(_)));
        prop_assert_eq!(hop_limited, 1);
    }
}
