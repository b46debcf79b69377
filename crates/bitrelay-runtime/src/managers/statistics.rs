//! Routing and forwarding statistics

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bitrelay_core::RouteKind;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Forwarder Counters
// ----------------------------------------------------------------------------

/// Lock-free counters updated on the forwarding path
#[derive(Debug, Default)]
pub struct ForwarderCounters {
    pub relayed: AtomicU64,
    pub delivered: AtomicU64,
    pub duplicates: AtomicU64,
    pub expired: AtomicU64,
    pub hop_limited: AtomicU64,
    pub queued: AtomicU64,
    pub failed: AtomicU64,
    pub pending_dropped: AtomicU64,
    pub invalid_frames: AtomicU64,
    pub control_frames: AtomicU64,
}

impl ForwarderCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ForwarderStatistics {
        ForwarderStatistics {
            relayed: self.relayed.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            hop_limited: self.hop_limited.load(Ordering::Relaxed),
            queued: self.queued.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            pending_dropped: self.pending_dropped.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            control_frames: self.control_frames.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the forwarder counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwarderStatistics {
    /// Packets handed to a next hop
    pub relayed: u64,
    /// Packets addressed to this node
    pub delivered: u64,
    pub duplicates: u64,
    pub expired: u64,
    pub hop_limited: u64,
    /// Packets parked for lack of a next hop
    pub queued: u64,
    /// One-hop transfers that failed
    pub failed: u64,
    /// Pending packets dropped by age or retry budget
    pub pending_dropped: u64,
    pub invalid_frames: u64,
    pub control_frames: u64,
}

// ----------------------------------------------------------------------------
// Routing Statistics
// ----------------------------------------------------------------------------

/// Outcome statistics of the smart router
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingStatistics {
    pub total_messages: u64,
    pub successful_messages: u64,
    pub queued_messages: u64,
    /// Queued messages dropped after exhausting age or attempts
    pub dropped_messages: u64,
    pub no_route_messages: u64,
    pub failed_messages: u64,
    /// Running mean over successful deliveries
    pub average_latency_ms: f64,
    /// Successful deliveries per route kind
    pub route_type_counts: BTreeMap<RouteKind, u64>,
    pub forwarder: ForwarderStatistics,
}

impl RoutingStatistics {
    /// Record a successful delivery
    pub fn record_success(&mut self, kind: RouteKind, latency_ms: u64) {
        self.successful_messages += 1;
        let n = self.successful_messages as f64;
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / n;
        *self.route_type_counts.entry(kind).or_insert(0) += 1;
    }

    /// Share of messages delivered so far
    pub fn success_rate(&self) -> f64 {
        if self.total_messages == 0 {
            0.0
        } else {
            self.successful_messages as f64 / self.total_messages as f64
        }
    }
}
