//! Virtual shared radio medium
//!
//! Nodes running the engine get a [`SimulatedRadio`](crate::SimulatedRadio)
//! attached to a [`VirtualAir`]. Generic devices are passive entries that
//! only advertise hints and, optionally, echo whatever is written to them to
//! their own neighbours. Links are symmetric with a signal strength; failures
//! can be injected per link, per strategy, or per radio.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bitrelay_core::{AdvertisedHints, PeerId, RadioEvent, Sighting};
use tokio::sync::mpsc;
use tracing::debug;

use crate::radio::SimulatedRadio;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Behaviour of the shared medium
#[derive(Debug, Clone)]
pub struct AirConfig {
    /// Probability that a single write or advertisement is lost
    pub loss_rate: f64,
    /// Pause between scan rounds
    pub scan_interval: Duration,
    /// Delay applied to every delivered frame
    pub latency: Duration,
}

impl Default for AirConfig {
    fn default() -> Self {
        Self {
            loss_rate: 0.0,
            scan_interval: Duration::from_millis(100),
            latency: Duration::ZERO,
        }
    }
}

impl AirConfig {
    /// Lossless, instant medium with fast scans
    pub fn ideal() -> Self {
        Self {
            scan_interval: Duration::from_millis(20),
            ..Self::default()
        }
    }

    /// Medium that loses the given share of transfers
    pub fn lossy(loss_rate: f64) -> Self {
        Self {
            loss_rate,
            ..Self::ideal()
        }
    }
}

// ----------------------------------------------------------------------------
// Transfer Log
// ----------------------------------------------------------------------------

/// One transfer observed on the medium
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRecord {
    pub from: PeerId,
    /// `None` for advertisements
    pub to: Option<PeerId>,
    pub strategy: &'static str,
    pub bytes: usize,
    pub delivered: bool,
}

// ----------------------------------------------------------------------------
// Air State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceKind {
    Software,
    Generic { rebroadcast: bool },
}

#[derive(Debug)]
pub(crate) struct Device {
    pub(crate) kind: DeviceKind,
    pub(crate) hints: Option<AdvertisedHints>,
    pub(crate) events: Option<mpsc::UnboundedSender<RadioEvent>>,
}

#[derive(Debug, Default)]
pub(crate) struct AirState {
    pub(crate) devices: HashMap<PeerId, Device>,
    links: HashMap<(PeerId, PeerId), i16>,
    failing_links: HashSet<(PeerId, PeerId)>,
    failing_strategies: HashSet<(PeerId, &'static str)>,
    disabled: HashSet<PeerId>,
    pub(crate) transfers: Vec<TransferRecord>,
    pub(crate) channel_opens: u64,
}

fn link_key(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl AirState {
    pub(crate) fn signal(&self, a: &PeerId, b: &PeerId) -> Option<i16> {
        self.links.get(&link_key(a, b)).copied()
    }

    pub(crate) fn neighbours(&self, of: &PeerId) -> Vec<(PeerId, i16)> {
        self.links
            .iter()
            .filter_map(|((a, b), signal)| {
                if a == of {
                    Some((b.clone(), *signal))
                } else if b == of {
                    Some((a.clone(), *signal))
                } else {
                    None
                }
            })
            .collect()
    }

    pub(crate) fn is_disabled(&self, node: &PeerId) -> bool {
        self.disabled.contains(node)
    }

    pub(crate) fn link_fails(&self, from: &PeerId, to: &PeerId) -> bool {
        self.failing_links.contains(&(from.clone(), to.clone()))
    }

    pub(crate) fn strategy_fails(&self, from: &PeerId, strategy: &'static str) -> bool {
        self.failing_strategies.contains(&(from.clone(), strategy))
    }

    /// Push bytes to a software node's event stream
    pub(crate) fn deliver(&self, to: &PeerId, from: &PeerId, bytes: Vec<u8>) -> bool {
        match self.devices.get(to) {
            Some(Device {
                kind: DeviceKind::Software,
                events: Some(events),
                ..
            }) => events
                .send(RadioEvent::Frame {
                    from: from.clone(),
                    bytes,
                })
                .is_ok(),
            _ => false,
        }
    }

    /// Deliver a write; generic echo devices pass it to their neighbours
    pub(crate) fn deliver_write(&self, from: &PeerId, to: &PeerId, bytes: &[u8]) -> bool {
        match self.devices.get(to).map(|device| device.kind) {
            Some(DeviceKind::Software) => self.deliver(to, from, bytes.to_vec()),
            Some(DeviceKind::Generic { rebroadcast: true }) => {
                let mut delivered = false;
                for (neighbour, _) in self.neighbours(to) {
                    if &neighbour != from {
                        delivered |= self.deliver(&neighbour, to, bytes.to_vec());
                    }
                }
                delivered
            }
            // Plain generic devices accept the write and do nothing with it
            Some(DeviceKind::Generic { rebroadcast: false }) => true,
            None => false,
        }
    }

    pub(crate) fn sightings_for(&self, observer: &PeerId) -> Vec<Sighting> {
        self.neighbours(observer)
            .into_iter()
            .filter_map(|(peer_id, signal_strength)| {
                let hints = self.devices.get(&peer_id)?.hints.clone()?;
                Some(Sighting {
                    address: peer_id.to_string(),
                    peer_id,
                    hints,
                    signal_strength,
                })
            })
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Virtual Air
// ----------------------------------------------------------------------------

/// Shared radio medium connecting simulated nodes and devices
#[derive(Debug, Clone)]
pub struct VirtualAir {
    pub(crate) config: AirConfig,
    pub(crate) state: Arc<Mutex<AirState>>,
}

impl Default for VirtualAir {
    fn default() -> Self {
        Self::new(AirConfig::default())
    }
}

impl VirtualAir {
    pub fn new(config: AirConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(AirState::default())),
        }
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, AirState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a node running the engine and return its radio
    pub fn radio(&self, id: &str) -> Arc<SimulatedRadio> {
        let peer_id = PeerId::new(id);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.state().devices.insert(
            peer_id.clone(),
            Device {
                kind: DeviceKind::Software,
                hints: None,
                events: Some(events_tx),
            },
        );
        debug!("Virtual air: attached node {}", peer_id);
        Arc::new(SimulatedRadio::new(peer_id, self.clone(), events_rx))
    }

    /// Add a generic device that does not run the engine
    ///
    /// With `rebroadcast`, anything written to it is passed on to its other
    /// neighbours, modelling a device that happens to relay.
    pub fn add_generic_device(&self, id: &str, hints: AdvertisedHints, rebroadcast: bool) -> PeerId {
        let peer_id = PeerId::new(id);
        self.state().devices.insert(
            peer_id.clone(),
            Device {
                kind: DeviceKind::Generic { rebroadcast },
                hints: Some(hints),
                events: None,
            },
        );
        peer_id
    }

    /// Put two devices in range of each other
    pub fn link(&self, a: &str, b: &str, signal_strength: i16) {
        self.state()
            .links
            .insert(link_key(&PeerId::new(a), &PeerId::new(b)), signal_strength);
    }

    /// Take two devices out of range
    pub fn unlink(&self, a: &str, b: &str) {
        self.state()
            .links
            .remove(&link_key(&PeerId::new(a), &PeerId::new(b)));
    }

    /// Make channel opens from `from` to `to` fail
    pub fn fail_link(&self, from: &str, to: &str) {
        self.state()
            .failing_links
            .insert((PeerId::new(from), PeerId::new(to)));
    }

    pub fn heal_link(&self, from: &str, to: &str) {
        self.state()
            .failing_links
            .remove(&(PeerId::new(from), PeerId::new(to)));
    }

    /// Make every transfer from `from` using the labelled strategy fail
    pub fn fail_strategy(&self, from: &str, strategy: &'static str) {
        self.state()
            .failing_strategies
            .insert((PeerId::new(from), strategy));
    }

    /// Switch a node's radio off
    pub fn disable_radio(&self, node: &str) {
        self.state().disabled.insert(PeerId::new(node));
    }

    pub fn enable_radio(&self, node: &str) {
        self.state().disabled.remove(&PeerId::new(node));
    }

    /// Announce a connection between two nodes to both of them
    pub fn connect(&self, a: &str, b: &str) {
        let (a, b) = (PeerId::new(a), PeerId::new(b));
        let state = self.state();
        let signal_strength = state.signal(&a, &b).unwrap_or(-60);
        for (to, other) in [(&a, &b), (&b, &a)] {
            if let Some(events) = state.devices.get(to).and_then(|device| device.events.as_ref()) {
                let _ = events.send(RadioEvent::Connected {
                    peer_id: other.clone(),
                    signal_strength,
                });
            }
        }
    }

    /// Announce that two nodes lost their connection
    pub fn disconnect(&self, a: &str, b: &str) {
        let (a, b) = (PeerId::new(a), PeerId::new(b));
        let state = self.state();
        for (to, other) in [(&a, &b), (&b, &a)] {
            if let Some(events) = state.devices.get(to).and_then(|device| device.events.as_ref()) {
                let _ = events.send(RadioEvent::Disconnected {
                    peer_id: other.clone(),
                });
            }
        }
    }

    /// Inject raw bytes as if `from` had sent them to `to`
    pub fn inject(&self, from: &str, to: &str, bytes: Vec<u8>) -> bool {
        self.state()
            .deliver(&PeerId::new(to), &PeerId::new(from), bytes)
    }

    /// Snapshot of every transfer so far
    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.state().transfers.clone()
    }

    /// Transfers sent by one node
    pub fn transfers_from(&self, node: &str) -> Vec<TransferRecord> {
        let node = PeerId::new(node);
        self.state()
            .transfers
            .iter()
            .filter(|record| record.from == node)
            .cloned()
            .collect()
    }

    /// Number of channel open attempts across the medium
    pub fn channel_opens(&self) -> u64 {
        self.state().channel_opens
    }

    pub fn clear_transfers(&self) {
        let mut state = self.state();
        state.transfers.clear();
        state.channel_opens = 0;
    }

    pub(crate) fn should_drop(&self) -> bool {
        self.config.loss_rate > 0.0 && fastrand::f64() < self.config.loss_rate
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
