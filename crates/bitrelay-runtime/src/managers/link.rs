//! Per-peer transfer serialization
//!
//! A physical link carries one connection at a time, so only one outbound
//! transfer per target peer may be in flight. Transfers to different peers
//! proceed concurrently.

use std::sync::Arc;

use bitrelay_core::PeerId;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

// ----------------------------------------------------------------------------
// Peer Locks
// ----------------------------------------------------------------------------

/// One async lock per peer, created on first use
#[derive(Debug, Default)]
pub struct PeerLocks {
    locks: DashMap<PeerId, Arc<Mutex<()>>>,
}

impl PeerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other transfer to `peer` is running
    pub async fn acquire(&self, peer: &PeerId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(peer.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Whether a transfer to `peer` is running right now
    pub fn is_busy(&self, peer: &PeerId) -> bool {
        self.locks
            .get(peer)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drop the lock of a peer that went away, unless a transfer holds it
    pub fn forget(&self, peer: &PeerId) {
        self.locks.remove_if(peer, |_, lock| lock.try_lock().is_ok());
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
