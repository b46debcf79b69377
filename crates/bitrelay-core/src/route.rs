//! Route candidates, estimation and the forwarding table
//!
//! [`RoutePath`] values are ephemeral ranking candidates rebuilt on every
//! routing attempt. [`RoutingTable`] holds multi-hop knowledge learned from
//! route replies, adverts and reverse paths of received packets.

use core::cmp::Ordering;
use core::fmt;
use core::time::Duration;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::capability::{RelayPeer, TransportStrategy};
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Estimation
// ----------------------------------------------------------------------------

/// Fixed latency of any route before per-hop costs
pub const BASE_LATENCY_MS: u64 = 200;
/// Latency added per hop
pub const PER_HOP_LATENCY_MS: u64 = 300;
/// Latency charged per hop for mesh routes learned from the table
pub const MESH_HOP_LATENCY_MS: u64 = 500;

/// Probability that one hop at the given signal strength succeeds
pub fn per_hop_reliability(signal_strength: i16) -> f32 {
    match signal_strength {
        s if s > -50 => 0.95,
        s if s > -70 => 0.85,
        s if s > -80 => 0.75,
        _ => 0.60,
    }
}

/// Latency penalty for one hop, the inverse of the signal bonus
pub fn signal_penalty_ms(signal_strength: i16) -> u64 {
    match signal_strength {
        s if s > -50 => 0,
        s if s > -70 => 100,
        s if s > -80 => 300,
        _ => 500,
    }
}

/// Estimated latency of a path whose hops have the given signal strengths
pub fn estimate_latency(signals: &[i16]) -> u64 {
    let penalties: u64 = signals.iter().copied().map(signal_penalty_ms).sum();
    BASE_LATENCY_MS + signals.len() as u64 * PER_HOP_LATENCY_MS + penalties
}

/// Estimated end-to-end reliability of a path
pub fn path_reliability(signals: &[i16]) -> f32 {
    signals.iter().copied().map(per_hop_reliability).product()
}

// ----------------------------------------------------------------------------
// Route Path
// ----------------------------------------------------------------------------

/// Source of a route candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RouteKind {
    /// A peer running this software, sent over the mesh
    DirectCapable,
    /// A multi-hop path from the forwarding table
    MeshHop,
    /// A generic relay reached through a borrowed strategy
    UniversalRelay,
    /// A capable hop followed by a generic relay hop
    Hybrid,
}

impl RouteKind {
    pub const ALL: [RouteKind; 4] = [
        RouteKind::DirectCapable,
        RouteKind::MeshHop,
        RouteKind::UniversalRelay,
        RouteKind::Hybrid,
    ];

    /// Fixed priority; lower is tried first
    pub fn priority(&self) -> u8 {
        match self {
            RouteKind::DirectCapable => 1,
            RouteKind::MeshHop => 2,
            RouteKind::UniversalRelay => 3,
            RouteKind::Hybrid => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RouteKind::DirectCapable => "direct",
            RouteKind::MeshHop => "mesh",
            RouteKind::UniversalRelay => "universal",
            RouteKind::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Hop list; most routes are one or two hops
pub type Hops = SmallVec<[PeerId; 4]>;

/// A ranked route candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutePath {
    pub kind: RouteKind,
    /// First element is the first hop; never empty
    pub hops: Hops,
    pub reliability: f32,
    pub estimated_latency_ms: u64,
    pub priority: u8,
}

impl RoutePath {
    /// Route through a peer running this software
    pub fn direct(peer: &RelayPeer) -> Self {
        let signals = [peer.signal_strength];
        Self {
            kind: RouteKind::DirectCapable,
            hops: smallvec::smallvec![peer.peer_id.clone()],
            reliability: path_reliability(&signals),
            estimated_latency_ms: estimate_latency(&signals),
            priority: RouteKind::DirectCapable.priority(),
        }
    }

    /// Route along a learned forwarding-table entry
    pub fn mesh_hop(entry: &RouteEntry) -> Self {
        let hop_count = entry.hop_count.max(1);
        let hops: Hops = if entry.path.len() > 1 {
            entry.path[..entry.path.len() - 1].iter().cloned().collect()
        } else {
            smallvec::smallvec![entry.next_hop.clone()]
        };
        Self {
            kind: RouteKind::MeshHop,
            hops,
            reliability: (0.8 - 0.1 * hop_count as f32).clamp(0.0, 1.0),
            estimated_latency_ms: hop_count as u64 * MESH_HOP_LATENCY_MS,
            priority: RouteKind::MeshHop.priority(),
        }
    }

    /// Route through a generic relay using its borrowed strategies
    pub fn universal(peer: &RelayPeer) -> Self {
        let estimated_latency_ms = match peer.best_strategy() {
            Some(TransportStrategy::StructuredChannel(_)) => 1_000,
            Some(TransportStrategy::AuxiliaryDataHijack(_)) => 2_000,
            _ => 3_000,
        };
        Self {
            kind: RouteKind::UniversalRelay,
            hops: smallvec::smallvec![peer.peer_id.clone()],
            reliability: (peer.reliability_score / 10.0).clamp(0.0, 1.0),
            estimated_latency_ms,
            priority: RouteKind::UniversalRelay.priority(),
        }
    }

    /// Two-stage route: capable peer first, then a generic relay
    pub fn hybrid(capable: &RelayPeer, generic: &RelayPeer) -> Self {
        let signals = [capable.signal_strength, generic.signal_strength];
        Self {
            kind: RouteKind::Hybrid,
            hops: smallvec::smallvec![capable.peer_id.clone(), generic.peer_id.clone()],
            reliability: path_reliability(&signals),
            estimated_latency_ms: estimate_latency(&signals),
            priority: RouteKind::Hybrid.priority(),
        }
    }

    /// First peer the message is handed to
    pub fn first_hop(&self) -> Option<&PeerId> {
        self.hops.first()
    }

    /// Identity used to collapse duplicate candidates
    pub fn dedup_key(&self) -> (RouteKind, Hops) {
        (self.kind, self.hops.clone())
    }

    /// Ranking order: priority ascending, reliability descending, latency ascending
    pub fn rank_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.reliability.total_cmp(&self.reliability))
            .then_with(|| self.estimated_latency_ms.cmp(&other.estimated_latency_ms))
    }
}

/// Drop duplicate candidates, keeping the first occurrence, then rank
pub fn rank_candidates(candidates: Vec<RoutePath>) -> Vec<RoutePath> {
    let mut seen: HashMap<(RouteKind, Hops), ()> = HashMap::new();
    let mut unique: Vec<RoutePath> = candidates
        .into_iter()
        .filter(|route| seen.insert(route.dedup_key(), ()).is_none())
        .collect();
    unique.sort_by(RoutePath::rank_cmp);
    unique
}

// ----------------------------------------------------------------------------
// Routing Table
// ----------------------------------------------------------------------------

/// Multi-hop knowledge about how to reach a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub target: PeerId,
    pub next_hop: PeerId,
    /// Hops from this node to the target
    pub hop_count: u8,
    /// Peers from the next hop up to and including the target
    pub path: Vec<PeerId>,
    pub learned_at: Timestamp,
}

impl RouteEntry {
    /// An entry whose path is just `next_hop` then `target`
    pub fn via(target: PeerId, next_hop: PeerId, hop_count: u8, now: Timestamp) -> Self {
        let path = if target == next_hop {
            vec![target.clone()]
        } else {
            vec![next_hop.clone(), target.clone()]
        };
        Self {
            target,
            next_hop,
            hop_count: hop_count.max(1),
            path,
            learned_at: now,
        }
    }

    /// An entry carrying a full discovered path (next hop first, target last)
    pub fn from_path(path: Vec<PeerId>, now: Timestamp) -> Option<Self> {
        let next_hop = path.first()?.clone();
        let target = path.last()?.clone();
        Some(Self {
            target,
            next_hop,
            hop_count: u8::try_from(path.len()).unwrap_or(u8::MAX),
            path,
            learned_at: now,
        })
    }
}

/// Forwarding table keyed by target
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    routes: HashMap<PeerId, RouteEntry>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entry, returning true if the table changed
    ///
    /// An existing entry is replaced when the new one is shorter, goes
    /// through the same next hop, or the existing one is older than `max_age`.
    pub fn learn(&mut self, entry: RouteEntry, max_age: Duration) -> bool {
        if entry.next_hop == entry.target && entry.hop_count > 1 {
            return false;
        }
        match self.routes.get(&entry.target) {
            Some(existing)
                if entry.hop_count > existing.hop_count
                    && entry.next_hop != existing.next_hop
                    && !existing.learned_at.is_older_than(max_age, entry.learned_at) =>
            {
                false
            }
            _ => {
                self.routes.insert(entry.target.clone(), entry);
                true
            }
        }
    }

    pub fn get(&self, target: &PeerId) -> Option<&RouteEntry> {
        self.routes.get(target)
    }

    pub fn next_hop(&self, target: &PeerId) -> Option<&PeerId> {
        self.routes.get(target).map(|entry| &entry.next_hop)
    }

    pub fn remove(&mut self, target: &PeerId) -> Option<RouteEntry> {
        self.routes.remove(target)
    }

    /// Forget every route whose path goes through `peer`
    pub fn remove_via(&mut self, peer: &PeerId) -> usize {
        let before = self.routes.len();
        self.routes
            .retain(|target, entry| target != peer && !entry.path.contains(peer) && &entry.next_hop != peer);
        before - self.routes.len()
    }

    /// Drop entries learned more than `max_age` before `now`
    pub fn evict_stale(&mut self, now: Timestamp, max_age: Duration) -> usize {
        let before = self.routes.len();
        self.routes
            .retain(|_, entry| !entry.learned_at.is_older_than(max_age, now));
        before - self.routes.len()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.values()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
