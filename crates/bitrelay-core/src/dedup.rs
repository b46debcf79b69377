//! Message deduplication for mesh forwarding
//!
//! Every message id a node has originated, delivered or relayed is recorded
//! here so the same message is never processed twice. Membership is exact:
//! a false positive would silently drop a legitimate message.

use core::time::Duration;
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Statistics
// ----------------------------------------------------------------------------

/// Statistics for deduplication behaviour
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicationStats {
    /// Total ids checked
    pub packets_processed: u64,
    /// Ids that were already present
    pub duplicates_detected: u64,
    /// Ids purged because they left the window
    pub entries_expired: u64,
}

impl DeduplicationStats {
    /// Fraction of processed ids that were duplicates
    pub fn duplicate_rate(&self) -> f64 {
        if self.packets_processed == 0 {
            0.0
        } else {
            (self.duplicates_detected as f64) / (self.packets_processed as f64)
        }
    }
}

// ----------------------------------------------------------------------------
// Deduplication Manager
// ----------------------------------------------------------------------------

/// Windowed set of processed message ids
#[derive(Debug, Clone)]
pub struct DeduplicationManager {
    seen: HashMap<Uuid, Timestamp>,
    window: Duration,
    stats: DeduplicationStats,
}

impl DeduplicationManager {
    /// Create a manager that remembers ids for `window`
    pub fn new(window: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            window,
            stats: DeduplicationStats::default(),
        }
    }

    /// Record an id, returning true if it had already been seen
    pub fn check_and_add(&mut self, message_id: Uuid, now: Timestamp) -> bool {
        self.stats.packets_processed += 1;
        if self.seen.contains_key(&message_id) {
            self.stats.duplicates_detected += 1;
            return true;
        }
        self.seen.insert(message_id, now);
        false
    }

    /// Check membership without recording
    pub fn is_duplicate(&self, message_id: &Uuid) -> bool {
        self.seen.contains_key(message_id)
    }

    /// Record an id without touching statistics
    pub fn mark_seen(&mut self, message_id: Uuid, now: Timestamp) {
        self.seen.entry(message_id).or_insert(now);
    }

    /// Drop ids recorded longer than the window ago
    pub fn maintain(&mut self, now: Timestamp) -> usize {
        let window = self.window;
        let before = self.seen.len();
        self.seen
            .retain(|_, recorded_at| !recorded_at.is_older_than(window, now));
        let purged = before - self.seen.len();
        self.stats.entries_expired += purged as u64;
        purged
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn stats(&self) -> &DeduplicationStats {
        &self.stats
    }

    /// Clear all ids and reset statistics
    pub fn clear(&mut self) {
        self.seen.clear();
        self.stats = DeduplicationStats::default();
    }
}

impl Default for DeduplicationManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30 * 60))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_detection() {
        let mut dedup = DeduplicationManager::default();
        let id = Uuid::new_v4();
        let now = Timestamp::new(1_000);

        assert!(!dedup.check_and_add(id, now));
        assert!(dedup.check_and_add(id, now));
        assert!(dedup.is_duplicate(&id));
        assert_eq!(dedup.stats().duplicates_detected, 1);
        assert_eq!(dedup.stats().duplicate_rate(), 0.5);
    }

    #[test]
    fn test_window_purge() {
        let mut dedup = DeduplicationManager::new(Duration::from_millis(100));
        let old = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        dedup.check_and_add(old, Timestamp::new(0));
        dedup.check_and_add(fresh, Timestamp::new(150));

        assert_eq!(dedup.maintain(Timestamp::new(200)), 1);
        assert!(!dedup.is_duplicate(&old));
        assert!(dedup.is_duplicate(&fresh));
        assert_eq!(dedup.stats().entries_expired, 1);
    }

    #[test]
    fn test_distinct_ids_never_collide() {
        let mut dedup = DeduplicationManager::default();
        let now = Timestamp::new(0);
        for _ in 0..1_000 {
            assert!(!dedup.check_and_add(Uuid::new_v4(), now));
        }
        assert_eq!(dedup.len(), 1_000);
    }
}
