//! Pending queue for items that could not be sent yet
//!
//! Used by the forwarder for packets without a next hop and by the router
//! for messages without any route. Entries are retried in arrival order and
//! dropped once they exceed their age or retry budget.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::time::Duration;
use uuid::Uuid;

use crate::types::Timestamp;

// ----------------------------------------------------------------------------
// Pending Entry
// ----------------------------------------------------------------------------

/// An item waiting for a route
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEntry<T> {
    pub id: Uuid,
    pub item: T,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
}

impl<T> PendingEntry<T> {
    /// Age of the entry at `now`
    pub fn age(&self, now: Timestamp) -> Duration {
        now.duration_since(self.enqueued_at)
    }

    /// Whether the entry has outlived its age or retry budget
    pub fn is_exhausted(&self, now: Timestamp, max_age: Duration, max_retries: u32) -> bool {
        self.retry_count >= max_retries || self.age(now) > max_age
    }
}

// ----------------------------------------------------------------------------
// Pending Queue
// ----------------------------------------------------------------------------

/// FIFO queue of pending items keyed by id
#[derive(Debug, Clone)]
pub struct PendingQueue<T> {
    entries: VecDeque<PendingEntry<T>>,
}

impl<T> Default for PendingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> PendingQueue<T> {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Enqueue an item; an id already queued is left untouched
    pub fn push(&mut self, id: Uuid, item: T, now: Timestamp) -> bool {
        if self.contains(&id) {
            return false;
        }
        self.entries.push_back(PendingEntry {
            id,
            item,
            enqueued_at: now,
            retry_count: 0,
        });
        true
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.entries.iter().any(|entry| entry.id == *id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&PendingEntry<T>> {
        self.entries.iter().find(|entry| entry.id == *id)
    }

    /// Remove an entry, returning its item
    pub fn remove(&mut self, id: &Uuid) -> Option<T> {
        let index = self.entries.iter().position(|entry| entry.id == *id)?;
        self.entries.remove(index).map(|entry| entry.item)
    }

    /// Count a failed retry against an entry, returning the new count
    pub fn record_failure(&mut self, id: &Uuid) -> Option<u32> {
        let entry = self.entries.iter_mut().find(|entry| entry.id == *id)?;
        entry.retry_count = entry.retry_count.saturating_add(1);
        Some(entry.retry_count)
    }

    /// Remove and return entries past their age or retry budget
    pub fn expire(
        &mut self,
        now: Timestamp,
        max_age: Duration,
        max_retries: u32,
    ) -> Vec<PendingEntry<T>> {
        let mut kept = VecDeque::with_capacity(self.entries.len());
        let mut expired = Vec::new();
        for entry in self.entries.drain(..) {
            if entry.is_exhausted(now, max_age, max_retries) {
                expired.push(entry);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        expired
    }

    /// Iterate entries in arrival order
    pub fn iter(&self) -> impl Iterator<Item = &PendingEntry<T>> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> PendingQueue<T> {
    /// Copy out `(id, item)` pairs for a retry pass
    pub fn snapshot(&self) -> Vec<(Uuid, T)> {
        self.entries
            .iter()
            .map(|entry| (entry.id, entry.item.clone()))
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order_and_duplicate_push() {
        let mut queue = PendingQueue::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(queue.push(a, "a", Timestamp::new(0)));
        assert!(queue.push(b, "b", Timestamp::new(1)));
        assert!(!queue.push(a, "again", Timestamp::new(2)));

        let order: Vec<_> = queue.snapshot().into_iter().map(|(_, item)| item).collect();
        assert_eq!(order, vec!["a", "b"]);
    }

    #[test]
    fn test_remove_and_failure_count() {
        let mut queue = PendingQueue::new();
        let id = Uuid::new_v4();
        queue.push(id, 7u8, Timestamp::new(0));
        assert_eq!(queue.record_failure(&id), Some(1));
        assert_eq!(queue.record_failure(&id), Some(2));
        assert_eq!(queue.remove(&id), Some(7));
        assert!(queue.is_empty());
        assert_eq!(queue.record_failure(&id), None);
    }

    #[test]
    fn test_expire_by_age_and_retries() {
        let mut queue = PendingQueue::new();
        let old = Uuid::new_v4();
        let tired = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        queue.push(old, (), Timestamp::new(0));
        queue.push(tired, (), Timestamp::new(900));
        queue.push(fresh, (), Timestamp::new(900));
        for _ in 0..5 {
            queue.record_failure(&tired);
        }

        let expired = queue.expire(Timestamp::new(1_001), Duration::from_millis(1_000), 5);
        let ids: Vec<_> = expired.iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec![old, tired]);
        assert_eq!(queue.len(), 1);
        assert!(queue.contains(&fresh));
    }
}
