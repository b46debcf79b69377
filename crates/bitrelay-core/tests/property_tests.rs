//! Property-based tests for scoring bounds, packet invariants and the codec
//!
//! These tests verify invariants that must hold for any advertisement, any
//! signal strength and any byte sequence arriving off the air.

use std::time::Duration;

use bitrelay_core::{
    capability::{HijackKind, BATTERY_SERVICE, MESSAGE_SERVICE, NORDIC_UART_SERVICE},
    classify, reliability_score, AdvertisedHints, Frame, MeshPacket, PeerId, Timestamp,
    TransportStrategy,
};
use proptest::prelude::*;
use uuid::Uuid;

/// Generate arbitrary PeerId for property tests
fn arb_peer_id() -> impl Strategy<Value = PeerId> {
    "[A-F0-9]{1,12}".prop_map(PeerId::new)
}

/// Generate an arbitrary strategy
fn arb_strategy() -> impl Strategy<Value = TransportStrategy> {
    prop_oneof![
        any::<u128>().prop_map(|raw| TransportStrategy::StructuredChannel(Uuid::from_u128(raw))),
        Just(TransportStrategy::IdentifierEncoding),
        Just(TransportStrategy::AuxiliaryDataHijack(HijackKind::ManufacturerData)),
        Just(TransportStrategy::AuxiliaryDataHijack(HijackKind::ServiceData)),
        Just(TransportStrategy::BroadcastChunking),
    ]
}

/// Generate arbitrary advertisement hints
fn arb_hints() -> impl Strategy<Value = AdvertisedHints> {
    (
        proptest::option::of("[a-zA-Z0-9 _-]{0,24}"),
        proptest::collection::vec(
            prop_oneof![
                Just(MESSAGE_SERVICE),
                Just(NORDIC_UART_SERVICE),
                Just(BATTERY_SERVICE),
                any::<u128>().prop_map(Uuid::from_u128),
            ],
            0..4,
        ),
        proptest::collection::vec(any::<u8>(), 0..8),
        any::<bool>(),
    )
        .prop_map(|(name, services, data, with_service_data)| {
            let mut hints = AdvertisedHints::new();
            if let Some(name) = name {
                hints = hints.with_name(&name);
            }
            for service in services {
                hints = hints.with_service(service);
            }
            if !data.is_empty() {
                hints = hints.with_manufacturer_data(0x0059, data.clone());
            }
            if with_service_data {
                hints = hints.with_service_data(BATTERY_SERVICE, data);
            }
            hints
        })
}

/// Generate a packet that has travelled through a few distinct relays
fn arb_packet() -> impl Strategy<Value = MeshPacket> {
    (
        proptest::collection::btree_set(arb_peer_id(), 2..8),
        proptest::collection::vec(any::<u8>(), 0..256),
        any::<u32>(),
    )
        .prop_map(|(peers, payload, now)| {
            let mut peers: Vec<PeerId> = peers.into_iter().collect();
            let source = peers.remove(0);
            let target = peers.remove(0);
            let mut packet = MeshPacket::new(
                source,
                target,
                payload,
                Timestamp::new(now as u64),
                Duration::from_secs(1_800),
            );
            for relay in peers {
                packet.advance(relay).unwrap();
            }
            packet
        })
}

proptest! {
    /// Property: Reliability scores stay within [0, 10] for any strategy set
    #[test]
    fn reliability_score_bounded(
        strategies in proptest::collection::vec(arb_strategy(), 0..8),
        signal in any::<i16>(),
    ) {
        let score = reliability_score(&strategies, signal);
        prop_assert!((0.0..=10.0).contains(&score));
    }

    /// Property: Classification yields unique strategies and a bounded score
    #[test]
    fn classification_is_consistent(hints in arb_hints(), signal in -120i16..0) {
        let (_, strategies) = classify(&hints);
        for (index, strategy) in strategies.iter().enumerate() {
            prop_assert!(!strategies[..index].contains(strategy));
        }
        for pair in strategies.windows(2) {
            prop_assert!(pair[0].precedence() >= pair[1].precedence());
        }
        let score = reliability_score(&strategies, signal);
        prop_assert!((0.0..=10.0).contains(&score));
        prop_assert_eq!(strategies.is_empty(), hints.is_empty());
    }

    /// Property: Route taken never contains a peer twice
    #[test]
    fn advance_never_repeats_peer(packet in arb_packet(), extra in arb_peer_id()) {
        let mut packet = packet;
        let before = packet.hop_count;
        match packet.advance(extra.clone()) {
            Ok(()) => prop_assert_eq!(packet.hop_count, before + 1),
            Err(_) => prop_assert_eq!(packet.hop_count, before),
        }
        prop_assert!(packet.validate().is_ok());
    }

    /// Property: Encoded packets decode to the same packet
    #[test]
    fn packet_codec_preserves_fields(packet in arb_packet()) {
        let bytes = Frame::Data(packet.clone()).encode().unwrap();
        prop_assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Data(packet));
    }

    /// Property: Any single corrupted byte is rejected
    #[test]
    fn corrupted_frames_rejected(packet in arb_packet(), position in any::<prop::sample::Index>(), flip in 1u8..=255) {
        let mut bytes = Frame::Data(packet).encode().unwrap();
        let index = position.index(bytes.len());
        bytes[index] ^= flip;
        prop_assert!(Frame::decode(&bytes).is_err());
    }

    /// Property: Decoding arbitrary bytes never panics
    #[test]
    fn decode_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        let _ = Frame::decode(&bytes);
    }
}
