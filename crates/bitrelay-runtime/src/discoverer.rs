//! Relay capability discovery and single-hop transfers
//!
//! The discoverer owns the table of scored relay peers built from radio
//! sightings, and performs one-hop transfers using a peer's strategies,
//! most reliable first. Every attempt is bounded by a timeout; failures are
//! returned as errors and never escape as panics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitrelay_core::capability::{
    is_software_service, sort_by_precedence, EDDYSTONE_SERVICE, GENERIC_RELAY_SERVICE,
    MESSAGE_SERVICE,
};
use bitrelay_core::chunking::{
    chunk_payload, encode_identifier, structured_envelope, CHUNK_DATA_SIZE, HIJACK_COMPANY_ID,
    IDENTIFIER_DATA_SIZE,
};
use bitrelay_core::{
    AdvertisementPayload, DiscoveryConfig, HijackKind, PeerId, RadioLink, RelayCapableDevice,
    RelayError, RelayPeer, Result, Sighting, TimeSource, TransportStrategy,
};
use tokio::sync::RwLock;
use tracing::{debug, info, trace, warn};

use crate::managers::PeerLocks;

// ----------------------------------------------------------------------------
// Capability Discoverer
// ----------------------------------------------------------------------------

/// Scored table of relay-capable peers plus the strategy dispatcher
pub struct CapabilityDiscoverer {
    config: DiscoveryConfig,
    radio: Arc<dyn RadioLink>,
    time_source: Arc<dyn TimeSource>,
    locks: Arc<PeerLocks>,
    peers: RwLock<HashMap<PeerId, RelayPeer>>,
}

impl CapabilityDiscoverer {
    pub fn new(
        config: DiscoveryConfig,
        radio: Arc<dyn RadioLink>,
        time_source: Arc<dyn TimeSource>,
        locks: Arc<PeerLocks>,
    ) -> Self {
        Self {
            config,
            radio,
            time_source,
            locks,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Classify and record a sighting
    ///
    /// Returns `None` when no strategy applies; the peer is then not a
    /// relay candidate.
    pub async fn observe(&self, sighting: &Sighting) -> Option<RelayPeer> {
        if sighting.peer_id == self.radio.local_id() {
            return None;
        }
        let now = self.time_source.now();
        let peer = RelayPeer::from_sighting(sighting, now)?;

        let mut peers = self.peers.write().await;
        if !peers.contains_key(&peer.peer_id) {
            debug!(
                "Discovered relay peer {} ({:?}, score {:.1}, {} strategies)",
                peer.peer_id,
                peer.capability,
                peer.reliability_score,
                peer.strategies.len()
            );
        }
        peers.insert(peer.peer_id.clone(), peer.clone());
        Some(peer)
    }

    /// Look up a peer regardless of freshness
    pub async fn get(&self, peer_id: &PeerId) -> Option<RelayPeer> {
        self.peers.read().await.get(peer_id).cloned()
    }

    /// Viable peers, best score first
    pub async fn capable_peers(&self) -> Vec<RelayPeer> {
        let now = self.time_source.now();
        let window = self.config.freshness_window();
        let floor = self.config.signal_floor_dbm;

        let mut viable: Vec<RelayPeer> = self
            .peers
            .read()
            .await
            .values()
            .filter(|peer| peer.is_viable(now, window, floor))
            .cloned()
            .collect();
        viable.sort_by(|a, b| {
            b.reliability_score
                .total_cmp(&a.reliability_score)
                .then_with(|| a.peer_id.cmp(&b.peer_id))
        });
        viable
    }

    /// Diagnostic snapshot of viable relay-capable devices
    pub async fn relay_capable_devices(&self) -> Vec<RelayCapableDevice> {
        self.capable_peers()
            .await
            .iter()
            .map(RelayPeer::to_device_info)
            .collect()
    }

    /// Remove a peer and its transfer lock immediately
    pub async fn forget(&self, peer_id: &PeerId) -> Option<RelayPeer> {
        let removed = self.peers.write().await.remove(peer_id);
        self.locks.forget(peer_id);
        removed
    }

    /// Evict peers not seen within the freshness window
    pub async fn evict_stale(&self) -> usize {
        let now = self.time_source.now();
        let window = self.config.freshness_window();
        let mut peers = self.peers.write().await;
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|peer| !peer.is_fresh(now, window))
            .map(|peer| peer.peer_id.clone())
            .collect();
        for peer_id in &stale {
            peers.remove(peer_id);
            self.locks.forget(peer_id);
        }
        if !stale.is_empty() {
            info!("Evicted {} stale relay peers", stale.len());
        }
        stale.len()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    // ------------------------------------------------------------------------
    // Transfers
    // ------------------------------------------------------------------------

    /// Structured send to a peer running this software
    pub async fn send_direct(&self, peer_id: &PeerId, bytes: &[u8]) -> Result<()> {
        let strategy = TransportStrategy::StructuredChannel(MESSAGE_SERVICE);
        let _guard = self.locks.acquire(peer_id).await;
        self.bounded(&strategy, self.dispatch(peer_id, &strategy, bytes))
            .await
    }

    /// Attempt a single-hop transfer with one strategy
    pub async fn relay_via(
        &self,
        peer: &RelayPeer,
        strategy: &TransportStrategy,
        bytes: &[u8],
    ) -> Result<()> {
        let _guard = self.locks.acquire(&peer.peer_id).await;
        self.bounded(strategy, self.dispatch(&peer.peer_id, strategy, bytes))
            .await
    }

    /// Try a peer's strategies in precedence order until one succeeds
    ///
    /// Radio unavailability aborts immediately; any other failure moves on
    /// to the next strategy.
    pub async fn relay_through(&self, peer: &RelayPeer, bytes: &[u8]) -> Result<TransportStrategy> {
        let mut strategies = peer.strategies.clone();
        sort_by_precedence(&mut strategies);

        let mut last_error = None;
        for strategy in strategies {
            match self.relay_via(peer, &strategy, bytes).await {
                Ok(()) => {
                    debug!("Relayed {} bytes to {} via {}", bytes.len(), peer.peer_id, strategy.label());
                    return Ok(strategy);
                }
                Err(e) if e.is_transport_unavailable() => {
                    warn!("Radio unavailable while relaying to {}: {}", peer.peer_id, e);
                    return Err(e);
                }
                Err(e) => {
                    debug!(
                        "Strategy {} to {} failed: {}; trying next",
                        strategy.label(),
                        peer.peer_id,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            RelayError::send_failed(&peer.peer_id, "peer offers no strategies")
        }))
    }

    fn timeout_for(&self, strategy: &TransportStrategy) -> Duration {
        if strategy.is_connected() {
            self.config.channel_timeout()
        } else {
            self.config.strategy_timeout()
        }
    }

    async fn bounded<F>(&self, strategy: &TransportStrategy, attempt: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let limit = self.timeout_for(strategy);
        match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::timeout(limit.as_millis() as u64)),
        }
    }

    async fn dispatch(&self, peer_id: &PeerId, strategy: &TransportStrategy, bytes: &[u8]) -> Result<()> {
        match strategy {
            TransportStrategy::StructuredChannel(service) => {
                let framed = if is_software_service(service) {
                    bytes.to_vec()
                } else {
                    structured_envelope(bytes)?
                };
                let mut channel = self.radio.open_channel(peer_id, strategy).await?;
                let sent = channel.send(&framed).await;
                if let Err(e) = channel.close().await {
                    trace!("Closing channel to {} failed: {}", peer_id, e);
                }
                sent
            }
            TransportStrategy::IdentifierEncoding => {
                let mut names = Vec::new();
                for chunk in chunk_payload(bytes, IDENTIFIER_DATA_SIZE)? {
                    names.push(AdvertisementPayload::LocalName(encode_identifier(&chunk)?));
                }
                self.advertise_all(names).await
            }
            TransportStrategy::AuxiliaryDataHijack(HijackKind::ManufacturerData) => {
                let payloads = chunk_payload(bytes, CHUNK_DATA_SIZE)?
                    .into_iter()
                    .map(|data| AdvertisementPayload::ManufacturerData {
                        company_id: HIJACK_COMPANY_ID,
                        data,
                    })
                    .collect();
                self.advertise_all(payloads).await
            }
            TransportStrategy::AuxiliaryDataHijack(HijackKind::ServiceData) => {
                let payloads = chunk_payload(bytes, CHUNK_DATA_SIZE)?
                    .into_iter()
                    .map(|data| AdvertisementPayload::ServiceData {
                        service: EDDYSTONE_SERVICE,
                        data,
                    })
                    .collect();
                self.advertise_all(payloads).await
            }
            TransportStrategy::BroadcastChunking => {
                let payloads = chunk_payload(bytes, CHUNK_DATA_SIZE)?
                    .into_iter()
                    .map(|data| AdvertisementPayload::ServiceData {
                        service: GENERIC_RELAY_SERVICE,
                        data,
                    })
                    .collect();
                self.advertise_all(payloads).await
            }
        }
    }

    async fn advertise_all(&self, payloads: Vec<AdvertisementPayload>) -> Result<()> {
        let delay = self.config.chunk_delay();
        let count = payloads.len();
        for (index, payload) in payloads.into_iter().enumerate() {
            self.radio.emit_advertisement(payload, delay).await?;
            if index + 1 < count && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use bitrelay_core::capability::HEART_RATE_SERVICE;
    use bitrelay_core::{AdvertisedHints, RelayCapability, SystemTimeSource, Timestamp};
    use bitrelay_harness::{AirConfig, ManualClock, VirtualAir};

    fn discoverer(air: &VirtualAir, id: &str) -> CapabilityDiscoverer {
        CapabilityDiscoverer::new(
            DiscoveryConfig::testing(),
            air.radio(id),
            Arc::new(SystemTimeSource),
            Arc::new(PeerLocks::new()),
        )
    }

    #[tokio::test]
    async fn test_observe_scores_and_skips_self() {
        let air = VirtualAir::new(AirConfig::ideal());
        let discoverer = discoverer(&air, "SELF");

        let own = Sighting::new("SELF", AdvertisedHints::software("me"), -30);
        assert!(discoverer.observe(&own).await.is_none());

        let hints = AdvertisedHints::new().with_service(HEART_RATE_SERVICE);
        let peer = discoverer
            .observe(&Sighting::new("AA:00:00:00:00:01", hints, -45))
            .await
            .unwrap();
        assert_eq!(peer.capability, RelayCapability::Basic);
        assert!(peer.reliability_score >= 8.0);
        assert_eq!(discoverer.relay_capable_devices().await.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_and_eviction_release_peer_locks() {
        let air = VirtualAir::new(AirConfig::ideal());
        let _b_radio = air.radio("B");
        let _c_radio = air.radio("C");
        air.link("SELF", "B", -50);
        air.link("SELF", "C", -50);
        let clock = Arc::new(ManualClock::new(Timestamp::new(1_000_000)));
        let locks = Arc::new(PeerLocks::new());
        let discoverer = CapabilityDiscoverer::new(
            DiscoveryConfig::testing(),
            air.radio("SELF"),
            clock.clone(),
            locks.clone(),
        );
        for id in ["B", "C"] {
            let sighting = Sighting::new(id, AdvertisedHints::software(id), -50);
            discoverer.observe(&sighting).await.unwrap();
            discoverer.send_direct(&PeerId::new(id), b"hi").await.unwrap();
        }
        assert_eq!(locks.len(), 2);

        assert!(discoverer.forget(&PeerId::new("B")).await.is_some());
        assert_eq!(locks.len(), 1);

        clock.advance(Duration::from_secs(61));
        assert_eq!(discoverer.evict_stale().await, 1);
        assert!(locks.is_empty());
        assert_eq!(discoverer.peer_count().await, 0);
    }

    #[tokio::test]
    async fn test_weak_signal_not_viable() {
        let air = VirtualAir::new(AirConfig::ideal());
        let discoverer = discoverer(&air, "SELF");
        let sighting = Sighting::new("FAR", AdvertisedHints::software("far"), -85);
        assert!(discoverer.observe(&sighting).await.is_some());
        assert!(discoverer.capable_peers().await.is_empty());
        assert_eq!(discoverer.peer_count().await, 1);
    }

    #[tokio::test]
    async fn test_relay_through_falls_back_to_next_strategy() {
        let air = VirtualAir::new(AirConfig::ideal());
        let discoverer = discoverer(&air, "SELF");
        air.add_generic_device(
            "WATCH",
            AdvertisedHints::new()
                .with_name("Fitness Watch")
                .with_service(HEART_RATE_SERVICE),
            false,
        );
        air.link("SELF", "WATCH", -50);
        air.fail_strategy("SELF", "structured-channel");

        let peer = discoverer
            .observe(&Sighting::new("WATCH", AdvertisedHints::new().with_name("Fitness Watch").with_service(HEART_RATE_SERVICE), -50))
            .await
            .unwrap();
        let used = discoverer.relay_through(&peer, b"hello relay").await.unwrap();
        assert_eq!(used, TransportStrategy::BroadcastChunking);

        let labels: Vec<_> = air.transfers_from("SELF").iter().map(|t| t.strategy).collect();
        assert_eq!(labels, vec!["broadcast-chunking"]);
    }

    #[tokio::test]
    async fn test_unavailable_radio_aborts_without_fallback() {
        let air = VirtualAir::new(AirConfig::ideal());
        let discoverer = discoverer(&air, "SELF");
        air.add_generic_device("WATCH", AdvertisedHints::new().with_service(HEART_RATE_SERVICE), false);
        air.link("SELF", "WATCH", -50);
        air.disable_radio("SELF");

        let hints = AdvertisedHints::new().with_service(HEART_RATE_SERVICE);
        let peer = discoverer.observe(&Sighting::new("WATCH", hints, -50)).await.unwrap();
        let err = discoverer.relay_through(&peer, b"x").await.unwrap_err();
        assert!(err.is_transport_unavailable());
        assert_eq!(air.channel_opens(), 0);
    }
}
