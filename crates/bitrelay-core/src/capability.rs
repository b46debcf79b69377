//! Relay capability classification and reliability scoring
//!
//! Turns raw presence sightings into strategy-tagged, scored [`RelayPeer`]
//! records. Everything here is pure; the runtime's discoverer owns the peer
//! table and performs transfers.

use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Well-Known Services
// ----------------------------------------------------------------------------

/// Service carrying mesh packets between software-capable peers
pub const MESSAGE_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_9012_123456789abc);
/// Service carrying route probes, replies and adverts
pub const DISCOVERY_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_9012_123456789abd);
/// Service used for broadcast relay towards peers without the software
pub const GENERIC_RELAY_SERVICE: Uuid = Uuid::from_u128(0x12345678_1234_5678_9012_123456789abe);

pub const NORDIC_UART_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);
pub const EDDYSTONE_SERVICE: Uuid = Uuid::from_u128(0x0000feaa_0000_1000_8000_00805f9b34fb);

/// Generic services known to accept writes from arbitrary centrals
pub const COMMON_GENERIC_SERVICES: [Uuid; 6] = [
    NORDIC_UART_SERVICE,
    HEART_RATE_SERVICE,
    BATTERY_SERVICE,
    DEVICE_INFORMATION_SERVICE,
    GENERIC_ACCESS_SERVICE,
    EDDYSTONE_SERVICE,
];

const SIG_BASE_MASK: u128 = 0xFFFF0000_FFFF_FFFF_FFFF_FFFFFFFFFFFF;
const SIG_BASE_VALUE: u128 = 0x00000000_0000_1000_8000_00805F9B34FB;

/// Whether a service id is a 16-bit SIG-assigned service on the base UUID
pub fn is_sig_assigned(service: &Uuid) -> bool {
    service.as_u128() & SIG_BASE_MASK == SIG_BASE_VALUE
}

/// Whether a service id marks a peer running this software
pub fn is_software_service(service: &Uuid) -> bool {
    *service == MESSAGE_SERVICE || *service == DISCOVERY_SERVICE
}

/// Minimum advertised-name length that can carry an encoded payload
pub const MIN_ENCODABLE_NAME_LEN: usize = 8;

// ----------------------------------------------------------------------------
// Capability and Strategy
// ----------------------------------------------------------------------------

/// How much of the relay protocol a peer can take part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RelayCapability {
    /// Not usable as a relay
    None,
    /// Only exposes a generic transport surface
    Basic,
    /// Runs this software
    Full,
}

/// Which auxiliary advertisement field is borrowed to carry data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HijackKind {
    ManufacturerData,
    ServiceData,
}

/// A technique for moving bytes across a link to a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportStrategy {
    /// Connect and write to a structured channel (service) on the peer
    StructuredChannel(Uuid),
    /// Encode chunks into an advertised identifier (local name)
    IdentifierEncoding,
    /// Borrow manufacturer or service data fields in advertisements
    AuxiliaryDataHijack(HijackKind),
    /// Chunked broadcast on the generic relay service
    BroadcastChunking,
}

impl TransportStrategy {
    /// Fixed scoring weight of this strategy
    pub fn weight(&self) -> f32 {
        match self {
            TransportStrategy::StructuredChannel(_) => 10.0,
            TransportStrategy::AuxiliaryDataHijack(HijackKind::ServiceData) => 8.0,
            TransportStrategy::AuxiliaryDataHijack(HijackKind::ManufacturerData) => 7.0,
            TransportStrategy::BroadcastChunking => 5.0,
            TransportStrategy::IdentifierEncoding => 3.0,
        }
    }

    /// Reliability precedence used as a tie-break (higher is tried first)
    pub fn precedence(&self) -> u8 {
        match self {
            TransportStrategy::StructuredChannel(_) => 4,
            TransportStrategy::AuxiliaryDataHijack(_) => 3,
            TransportStrategy::BroadcastChunking => 2,
            TransportStrategy::IdentifierEncoding => 1,
        }
    }

    /// Short label for logs and statistics
    pub fn label(&self) -> &'static str {
        match self {
            TransportStrategy::StructuredChannel(_) => "structured-channel",
            TransportStrategy::IdentifierEncoding => "identifier-encoding",
            TransportStrategy::AuxiliaryDataHijack(HijackKind::ManufacturerData) => {
                "manufacturer-data"
            }
            TransportStrategy::AuxiliaryDataHijack(HijackKind::ServiceData) => "service-data",
            TransportStrategy::BroadcastChunking => "broadcast-chunking",
        }
    }

    /// Whether the strategy needs a connection rather than advertisements
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportStrategy::StructuredChannel(_))
    }
}

/// Order strategies most-reliable-first
pub fn sort_by_precedence(strategies: &mut [TransportStrategy]) {
    strategies.sort_by(|a, b| {
        b.precedence()
            .cmp(&a.precedence())
            .then_with(|| b.weight().total_cmp(&a.weight()))
    });
}

// ----------------------------------------------------------------------------
// Sightings
// ----------------------------------------------------------------------------

/// A manufacturer-specific advertisement record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerRecord {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// A service-data advertisement record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDataRecord {
    pub service: Uuid,
    pub data: Vec<u8>,
}

/// What a peer reveals about itself in its presence advertisement
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvertisedHints {
    pub local_name: Option<String>,
    pub service_ids: Vec<Uuid>,
    pub manufacturer_data: Vec<ManufacturerRecord>,
    pub service_data: Vec<ServiceDataRecord>,
}

impl AdvertisedHints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hints a node running this software advertises about itself
    pub fn software(name: &str) -> Self {
        Self::new()
            .with_name(name)
            .with_service(MESSAGE_SERVICE)
            .with_service(DISCOVERY_SERVICE)
            .with_service(GENERIC_RELAY_SERVICE)
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.local_name = Some(name.to_string());
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        if !self.service_ids.contains(&service) {
            self.service_ids.push(service);
        }
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: Vec<u8>) -> Self {
        self.manufacturer_data.push(ManufacturerRecord { company_id, data });
        self
    }

    pub fn with_service_data(mut self, service: Uuid, data: Vec<u8>) -> Self {
        self.service_data.push(ServiceDataRecord { service, data });
        self
    }

    /// Whether the advertisement carries anything at all
    pub fn is_empty(&self) -> bool {
        self.local_name.is_none()
            && self.service_ids.is_empty()
            && self.manufacturer_data.is_empty()
            && self.service_data.is_empty()
    }
}

/// A single presence sighting produced by a radio scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sighting {
    pub peer_id: PeerId,
    pub address: String,
    pub hints: AdvertisedHints,
    pub signal_strength: i16,
}

impl Sighting {
    /// Create a sighting, deriving the peer id from the link-layer address
    pub fn new(address: &str, hints: AdvertisedHints, signal_strength: i16) -> Self {
        Self {
            peer_id: PeerId::from_address(address),
            address: address.to_string(),
            hints,
            signal_strength,
        }
    }
}

// ----------------------------------------------------------------------------
// Classification and Scoring
// ----------------------------------------------------------------------------

/// Classify which strategies a sighted peer plausibly accepts
///
/// Returned strategies are unique and ordered most-reliable-first.
pub fn classify(hints: &AdvertisedHints) -> (RelayCapability, Vec<TransportStrategy>) {
    let mut strategies: Vec<TransportStrategy> = Vec::new();
    let mut push = |strategy: TransportStrategy| {
        if !strategies.contains(&strategy) {
            strategies.push(strategy);
        }
    };

    let has_software = hints.service_ids.iter().any(is_software_service);
    if has_software {
        push(TransportStrategy::StructuredChannel(MESSAGE_SERVICE));
    }

    for service in &hints.service_ids {
        if COMMON_GENERIC_SERVICES.contains(service) || is_sig_assigned(service) {
            push(TransportStrategy::StructuredChannel(*service));
        }
    }

    if hints
        .local_name
        .as_ref()
        .map(|name| name.chars().count() >= MIN_ENCODABLE_NAME_LEN)
        .unwrap_or(false)
    {
        push(TransportStrategy::IdentifierEncoding);
    }

    if !hints.manufacturer_data.is_empty() {
        push(TransportStrategy::AuxiliaryDataHijack(HijackKind::ManufacturerData));
    }

    if !hints.service_data.is_empty() {
        push(TransportStrategy::AuxiliaryDataHijack(HijackKind::ServiceData));
    }

    // Any active advertiser is within broadcast range of our own advertisements.
    if !hints.is_empty() {
        push(TransportStrategy::BroadcastChunking);
    }

    sort_by_precedence(&mut strategies);

    let capability = if has_software {
        RelayCapability::Full
    } else if strategies.is_empty() {
        RelayCapability::None
    } else {
        RelayCapability::Basic
    };

    (capability, strategies)
}

/// Step bonus for signal strength
pub fn signal_bonus(signal_strength: i16) -> f32 {
    match signal_strength {
        s if s > -50 => 5.0,
        s if s > -70 => 3.0,
        s if s > -80 => 1.0,
        _ => 0.0,
    }
}

/// Reliability score in [0, 10]
///
/// The sum of strategy weights plus the signal bonus, divided by the number
/// of strategies, so many weak strategies do not outweigh one strong one.
pub fn reliability_score(strategies: &[TransportStrategy], signal_strength: i16) -> f32 {
    if strategies.is_empty() {
        return 0.0;
    }
    let total: f32 = strategies.iter().map(TransportStrategy::weight).sum();
    let score = (total + signal_bonus(signal_strength)) / strategies.len() as f32;
    score.clamp(0.0, 10.0)
}

// ----------------------------------------------------------------------------
// Relay Peer
// ----------------------------------------------------------------------------

/// A scored, strategy-tagged peer usable as a relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayPeer {
    pub peer_id: PeerId,
    pub display_name: String,
    pub address: String,
    pub signal_strength: i16,
    pub last_seen_at: Timestamp,
    /// 1 if the peer runs this software, otherwise at least 2
    pub hop_count: u8,
    pub capability: RelayCapability,
    pub strategies: Vec<TransportStrategy>,
    pub reliability_score: f32,
}

impl RelayPeer {
    /// Build a relay peer from a sighting, or `None` if no strategy applies
    pub fn from_sighting(sighting: &Sighting, seen_at: Timestamp) -> Option<Self> {
        let (capability, strategies) = classify(&sighting.hints);
        if strategies.is_empty() {
            return None;
        }
        let reliability_score = reliability_score(&strategies, sighting.signal_strength);
        Some(Self {
            peer_id: sighting.peer_id.clone(),
            display_name: sighting
                .hints
                .local_name
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
            address: sighting.address.clone(),
            signal_strength: sighting.signal_strength,
            last_seen_at: seen_at,
            hop_count: if capability == RelayCapability::Full { 1 } else { 2 },
            capability,
            strategies,
            reliability_score,
        })
    }

    /// A directly connected peer whose capabilities are not yet known
    pub fn connected(peer_id: PeerId, display_name: &str, signal_strength: i16, now: Timestamp) -> Self {
        let strategies = vec![TransportStrategy::StructuredChannel(GENERIC_RELAY_SERVICE)];
        let reliability_score = reliability_score(&strategies, signal_strength);
        Self {
            address: peer_id.to_string(),
            peer_id,
            display_name: display_name.to_string(),
            signal_strength,
            last_seen_at: now,
            hop_count: 2,
            capability: RelayCapability::Basic,
            strategies,
            reliability_score,
        }
    }

    /// Whether the peer runs this software
    pub fn has_software(&self) -> bool {
        self.capability == RelayCapability::Full
    }

    /// Whether the peer was seen within the freshness window
    pub fn is_fresh(&self, now: Timestamp, window: Duration) -> bool {
        !self.last_seen_at.is_older_than(window, now)
    }

    /// Whether the peer may be used for routing right now
    pub fn is_viable(&self, now: Timestamp, window: Duration, signal_floor: i16) -> bool {
        self.is_fresh(now, window) && self.signal_strength > signal_floor
    }

    /// Best (highest precedence) strategy, if any
    pub fn best_strategy(&self) -> Option<TransportStrategy> {
        self.strategies.first().copied()
    }

    /// Diagnostic snapshot for UI and tooling
    pub fn to_device_info(&self) -> RelayCapableDevice {
        RelayCapableDevice {
            peer_id: self.peer_id.clone(),
            name: self.display_name.clone(),
            address: self.address.clone(),
            signal_strength: self.signal_strength,
            reliability_score: self.reliability_score,
            strategies: self.strategies.clone(),
        }
    }
}

/// Read-only view of a relay-capable device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayCapableDevice {
    pub peer_id: PeerId,
    pub name: String,
    pub address: String,
    pub signal_strength: i16,
    pub reliability_score: f32,
    pub strategies: Vec<TransportStrategy>,
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
