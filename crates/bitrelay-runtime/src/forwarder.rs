//! Hop-by-hop mesh forwarding
//!
//! The forwarder owns this node's view of reachable peers, the learned
//! routing table, the dedup cache and the queue of packets that had no next
//! hop. All of it lives in one [`ForwardingState`] behind a single async
//! mutex; the lock is only held for bookkeeping and is always released
//! before a radio transfer starts.
//!
//! A packet goes through `dedup -> TTL/hop check -> next-hop selection ->
//! transfer`, ending as sent, delivered, queued, dropped or failed.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use bitrelay_core::chunking::open_structured_envelope;
use bitrelay_core::{
    ChunkReassembler, ControlMessage, DeduplicationManager, DiscoveryConfig, ForwarderConfig,
    Frame, MeshPacket, PeerId, PendingQueue, RelayError, RelayPeer, RouteEntry, RoutingTable,
    TimeSource, Timestamp,
};
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::discoverer::CapabilityDiscoverer;
use crate::managers::{ForwarderCounters, ForwarderStatistics};

// ----------------------------------------------------------------------------
// Outcomes
// ----------------------------------------------------------------------------

/// Why a packet was dropped without a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Duplicate,
    TtlExpired,
    HopLimitExceeded,
    RouteLoop,
}

impl DropReason {
    pub fn label(&self) -> &'static str {
        match self {
            DropReason::Duplicate => "duplicate",
            DropReason::TtlExpired => "ttl-expired",
            DropReason::HopLimitExceeded => "hop-limit",
            DropReason::RouteLoop => "route-loop",
        }
    }
}

/// Result of handing a packet to the forwarder
#[derive(Debug)]
pub enum RelayOutcome {
    /// Transferred to the next hop
    Sent { next_hop: PeerId },
    /// Addressed to this node and handed to the application
    Delivered,
    /// No next hop right now; parked in the pending queue
    Queued,
    Dropped(DropReason),
    /// The one-hop transfer failed
    Failed(RelayError),
}

impl RelayOutcome {
    /// Whether the packet left this node or reached its destination
    pub fn is_sent(&self) -> bool {
        matches!(self, RelayOutcome::Sent { .. } | RelayOutcome::Delivered)
    }
}

/// A packet addressed to this node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    pub message_id: Uuid,
    pub source: PeerId,
    pub payload: Vec<u8>,
    pub hop_count: u8,
    pub received_at: Timestamp,
}

/// An in-flight route search started with [`MeshForwarder::broadcast_probe`]
#[derive(Debug)]
pub struct RouteSearch {
    pub search_id: Uuid,
    /// Full paths (this node first, target last) as replies arrive
    pub replies: mpsc::UnboundedReceiver<Vec<PeerId>>,
    /// Number of peers the probe was handed to
    pub probes_sent: usize,
}

// ----------------------------------------------------------------------------
// Forwarding State
// ----------------------------------------------------------------------------

/// Everything the forwarder mutates, guarded by one lock
#[derive(Debug)]
struct ForwardingState {
    peers: HashMap<PeerId, RelayPeer>,
    routes: RoutingTable,
    dedup: DeduplicationManager,
    probes: DeduplicationManager,
    pending: PendingQueue<MeshPacket>,
}

fn next_hop_rank(a: &RelayPeer, b: &RelayPeer) -> Ordering {
    (!a.has_software())
        .cmp(&!b.has_software())
        .then_with(|| a.hop_count.cmp(&b.hop_count))
        .then_with(|| b.signal_strength.cmp(&a.signal_strength))
        .then_with(|| a.peer_id.cmp(&b.peer_id))
}

fn has_repeats(path: &[PeerId]) -> bool {
    path.iter()
        .enumerate()
        .any(|(index, hop)| path[..index].contains(hop))
}

// ----------------------------------------------------------------------------
// Mesh Forwarder
// ----------------------------------------------------------------------------

pub struct MeshForwarder {
    local_id: PeerId,
    config: ForwarderConfig,
    discovery: DiscoveryConfig,
    time_source: Arc<dyn TimeSource>,
    discoverer: Arc<CapabilityDiscoverer>,
    state: Mutex<ForwardingState>,
    reassembler: Mutex<ChunkReassembler>,
    probe_waiters: DashMap<Uuid, mpsc::UnboundedSender<Vec<PeerId>>>,
    ack_waiters: DashMap<Uuid, oneshot::Sender<PeerId>>,
    delivered_tx: mpsc::UnboundedSender<DeliveredMessage>,
    delivered_rx: StdMutex<Option<mpsc::UnboundedReceiver<DeliveredMessage>>>,
    pending_wakeup: Notify,
    counters: ForwarderCounters,
}

impl MeshForwarder {
    pub fn new(
        local_id: PeerId,
        config: ForwarderConfig,
        discovery: DiscoveryConfig,
        time_source: Arc<dyn TimeSource>,
        discoverer: Arc<CapabilityDiscoverer>,
    ) -> Self {
        let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();
        let state = ForwardingState {
            peers: HashMap::new(),
            routes: RoutingTable::new(),
            dedup: DeduplicationManager::new(config.dedup_window()),
            probes: DeduplicationManager::new(config.dedup_window()),
            pending: PendingQueue::new(),
        };
        Self {
            local_id,
            config,
            discovery,
            time_source,
            discoverer,
            state: Mutex::new(state),
            reassembler: Mutex::new(ChunkReassembler::new()),
            probe_waiters: DashMap::new(),
            ack_waiters: DashMap::new(),
            delivered_tx,
            delivered_rx: StdMutex::new(Some(delivered_rx)),
            pending_wakeup: Notify::new(),
            counters: ForwarderCounters::default(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Receiver of packets addressed to this node; can be taken once
    pub fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<DeliveredMessage>> {
        self.delivered_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn is_viable(&self, peer: &RelayPeer, now: Timestamp) -> bool {
        peer.is_viable(
            now,
            self.discovery.freshness_window(),
            self.discovery.signal_floor_dbm,
        )
    }

    // ------------------------------------------------------------------------
    // Peer Table
    // ------------------------------------------------------------------------

    /// Record a scanned peer; returns true if it was not known before
    pub async fn on_peer_seen(&self, peer: RelayPeer) -> bool {
        if peer.peer_id == self.local_id {
            return false;
        }
        let is_new = {
            let mut state = self.state.lock().await;
            state.peers.insert(peer.peer_id.clone(), peer).is_none()
        };
        if is_new {
            self.pending_wakeup.notify_one();
        }
        is_new
    }

    /// A link-level connection came up
    pub async fn on_peer_connected(&self, peer_id: PeerId, signal_strength: i16) {
        if peer_id == self.local_id {
            return;
        }
        let now = self.time_source.now();
        {
            let mut state = self.state.lock().await;
            match state.peers.get_mut(&peer_id) {
                Some(peer) => {
                    peer.last_seen_at = now;
                    peer.signal_strength = signal_strength;
                }
                None => {
                    let name = peer_id.to_string();
                    state.peers.insert(
                        peer_id.clone(),
                        RelayPeer::connected(peer_id.clone(), &name, signal_strength, now),
                    );
                }
            }
        }
        info!("Peer {} connected ({} dBm)", peer_id, signal_strength);
        self.pending_wakeup.notify_one();
    }

    /// A link-level connection went away; the peer stops being eligible
    pub async fn on_peer_disconnected(&self, peer_id: &PeerId) {
        let routes_dropped = {
            let mut state = self.state.lock().await;
            state.peers.remove(peer_id);
            state.routes.remove(peer_id);
            state.routes.remove_via(peer_id)
        };
        self.discoverer.forget(peer_id).await;
        info!(
            "Peer {} disconnected; dropped {} routes through it",
            peer_id, routes_dropped
        );
    }

    /// Resolves when a pending retry looks worthwhile
    pub async fn pending_notified(&self) {
        self.pending_wakeup.notified().await;
    }

    /// Every known peer, viable or not
    pub async fn known_peers(&self) -> Vec<RelayPeer> {
        self.state.lock().await.peers.values().cloned().collect()
    }

    /// Peers usable right now, in next-hop preference order
    pub async fn viable_peers(&self) -> Vec<RelayPeer> {
        let now = self.time_source.now();
        let mut peers: Vec<RelayPeer> = self
            .state
            .lock()
            .await
            .peers
            .values()
            .filter(|peer| self.is_viable(peer, now))
            .cloned()
            .collect();
        peers.sort_by(next_hop_rank);
        peers
    }

    pub async fn routing_entry(&self, target: &PeerId) -> Option<RouteEntry> {
        let now = self.time_source.now();
        let state = self.state.lock().await;
        state
            .routes
            .get(target)
            .filter(|entry| !entry.learned_at.is_older_than(self.config.route_max_age(), now))
            .cloned()
    }

    pub async fn routes(&self) -> Vec<RouteEntry> {
        self.state.lock().await.routes.entries().cloned().collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub fn statistics(&self) -> ForwarderStatistics {
        self.counters.snapshot()
    }

    // ------------------------------------------------------------------------
    // Relay
    // ------------------------------------------------------------------------

    /// Originate a packet carrying `payload` to `target`
    pub async fn send(&self, payload: Vec<u8>, target: PeerId) -> RelayOutcome {
        let now = self.time_source.now();
        let packet = MeshPacket::new(
            self.local_id.clone(),
            target,
            payload,
            now,
            self.config.message_ttl(),
        );
        self.relay(packet).await
    }

    /// Forward a packet, at most once per message id at this node
    pub async fn relay(&self, packet: MeshPacket) -> RelayOutcome {
        let now = self.time_source.now();
        {
            let mut state = self.state.lock().await;
            if state.dedup.check_and_add(packet.message_id, now) {
                ForwarderCounters::bump(&self.counters.duplicates);
                trace!("Dropping duplicate {}", packet.message_id);
                return RelayOutcome::Dropped(DropReason::Duplicate);
            }
        }
        self.forward(packet, now, true).await
    }

    /// Originate a packet through a chosen first hop
    ///
    /// Used by the router, which reuses one message id across attempts; the
    /// id is marked as seen here but never checked.
    pub async fn send_via(
        &self,
        first_hop: &PeerId,
        message_id: Uuid,
        target: PeerId,
        payload: Vec<u8>,
        request_ack: bool,
    ) -> RelayOutcome {
        let now = self.time_source.now();
        let mut packet = MeshPacket::with_id(
            message_id,
            self.local_id.clone(),
            target,
            payload,
            now,
            self.config.message_ttl(),
        );
        if request_ack {
            packet = packet.with_ack_requested();
        }

        let known = {
            let mut state = self.state.lock().await;
            state.dedup.mark_seen(message_id, now);
            state.peers.get(first_hop).cloned()
        };
        let peer = match known {
            Some(peer) => peer,
            None => match self.discoverer.get(first_hop).await {
                Some(peer) => peer,
                None => return RelayOutcome::Failed(RelayError::peer_not_found(first_hop)),
            },
        };
        self.transfer(&peer, packet).await
    }

    async fn forward(&self, packet: MeshPacket, now: Timestamp, park: bool) -> RelayOutcome {
        if packet.is_expired(now) {
            ForwarderCounters::bump(&self.counters.expired);
            debug!("Dropping {}: TTL expired", packet.message_id);
            return RelayOutcome::Dropped(DropReason::TtlExpired);
        }
        if packet.hop_limit_reached(self.config.max_hops) {
            ForwarderCounters::bump(&self.counters.hop_limited);
            debug!(
                "Dropping {}: hop limit {} reached",
                packet.message_id, self.config.max_hops
            );
            return RelayOutcome::Dropped(DropReason::HopLimitExceeded);
        }

        let next_hop = {
            let mut state = self.state.lock().await;
            let selected = self.select_next_hop(&state, &packet, now);
            if selected.is_none() && park {
                if state.pending.push(packet.message_id, packet.clone(), now) {
                    ForwarderCounters::bump(&self.counters.queued);
                }
            }
            selected
        };

        match next_hop {
            Some(peer) => self.transfer(&peer, packet).await,
            None => {
                debug!(
                    "No next hop for {} towards {}; queued",
                    packet.message_id, packet.target
                );
                RelayOutcome::Queued
            }
        }
    }

    /// Target first, then a learned route, then the best-ranked peer
    fn select_next_hop(
        &self,
        state: &ForwardingState,
        packet: &MeshPacket,
        now: Timestamp,
    ) -> Option<RelayPeer> {
        let eligible = |peer: &&RelayPeer| {
            peer.peer_id != self.local_id
                && !packet.has_visited(&peer.peer_id)
                && self.is_viable(peer, now)
        };

        if let Some(peer) = state.peers.get(&packet.target).filter(eligible) {
            return Some(peer.clone());
        }

        let learned = state
            .routes
            .get(&packet.target)
            .filter(|entry| !entry.learned_at.is_older_than(self.config.route_max_age(), now))
            .and_then(|entry| state.peers.get(&entry.next_hop))
            .filter(eligible);
        if let Some(peer) = learned {
            return Some(peer.clone());
        }

        state
            .peers
            .values()
            .filter(eligible)
            .min_by(|a, b| next_hop_rank(a, b))
            .cloned()
    }

    async fn transfer(&self, peer: &RelayPeer, mut packet: MeshPacket) -> RelayOutcome {
        let message_id = packet.message_id;
        if packet.advance(peer.peer_id.clone()).is_err() {
            warn!("Refusing to revisit {} with {}", peer.peer_id, message_id);
            return RelayOutcome::Dropped(DropReason::RouteLoop);
        }
        let bytes = match Frame::Data(packet).encode() {
            Ok(bytes) => bytes,
            Err(e) => return RelayOutcome::Failed(e),
        };

        let result = if peer.has_software() {
            self.discoverer.send_direct(&peer.peer_id, &bytes).await
        } else {
            self.discoverer
                .relay_through(peer, &bytes)
                .await
                .map(|_| ())
        };

        match result {
            Ok(()) => {
                ForwarderCounters::bump(&self.counters.relayed);
                debug!("Relayed {} to {}", message_id, peer.peer_id);
                RelayOutcome::Sent {
                    next_hop: peer.peer_id.clone(),
                }
            }
            Err(e) => {
                ForwarderCounters::bump(&self.counters.failed);
                warn!("Transfer of {} to {} failed: {}", message_id, peer.peer_id, e);
                RelayOutcome::Failed(e)
            }
        }
    }

    async fn park(&self, packet: MeshPacket) {
        let now = self.time_source.now();
        let mut state = self.state.lock().await;
        if state.pending.push(packet.message_id, packet, now) {
            ForwarderCounters::bump(&self.counters.queued);
        }
    }

    /// Retry parked packets against the current peer table
    ///
    /// Entries past their age or retry budget are dropped first. Returns the
    /// number of packets that left the queue by being sent.
    pub async fn sweep_pending(&self) -> usize {
        let now = self.time_source.now();
        let snapshot = {
            let mut state = self.state.lock().await;
            let dropped = state.pending.expire(
                now,
                self.config.pending_max_age(),
                self.config.pending_max_retries,
            );
            if !dropped.is_empty() {
                ForwarderCounters::add(&self.counters.pending_dropped, dropped.len() as u64);
                debug!("Dropped {} exhausted pending packets", dropped.len());
            }
            state.pending.snapshot()
        };

        let mut sent = 0;
        for (id, packet) in snapshot {
            match self.forward(packet, now, false).await {
                RelayOutcome::Sent { .. } | RelayOutcome::Delivered => {
                    self.state.lock().await.pending.remove(&id);
                    sent += 1;
                }
                RelayOutcome::Dropped(reason) => {
                    debug!("Pending {} dropped: {}", id, reason.label());
                    self.state.lock().await.pending.remove(&id);
                    ForwarderCounters::bump(&self.counters.pending_dropped);
                }
                RelayOutcome::Failed(_) => {
                    self.state.lock().await.pending.record_failure(&id);
                }
                RelayOutcome::Queued => {}
            }
        }
        if sent > 0 {
            info!("Pending sweep forwarded {} packets", sent);
        }
        sent
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Handle bytes received from `from`
    pub async fn on_frame_received(&self, from: PeerId, bytes: Vec<u8>) {
        let now = self.time_source.now();
        let assembled = self.reassembler.lock().await.accept(&from, &bytes, now);
        let Some(bytes) = assembled else {
            return;
        };

        let frame = match Frame::decode(&bytes) {
            Ok(frame) => frame,
            Err(first) => match Frame::decode(open_structured_envelope(&bytes)) {
                Ok(frame) => frame,
                Err(_) => {
                    ForwarderCounters::bump(&self.counters.invalid_frames);
                    debug!("Discarding invalid frame from {}: {}", from, first);
                    return;
                }
            },
        };

        match frame {
            Frame::Data(packet) => self.on_packet(from, packet, now).await,
            Frame::Control(message) => {
                ForwarderCounters::bump(&self.counters.control_frames);
                self.on_control(from, message, now).await;
            }
        }
    }

    async fn on_packet(&self, from: PeerId, mut packet: MeshPacket, now: Timestamp) {
        let holder = packet.route_taken.last().cloned();
        let handed_to_us = holder.as_ref() == Some(&self.local_id);
        let echoed = holder.as_ref() == Some(&from);
        if packet.target != self.local_id && !handed_to_us && !echoed {
            trace!("Ignoring overheard packet {} from {}", packet.message_id, from);
            return;
        }

        // Picked up from a generic relay: we are the new holder.
        if echoed && !handed_to_us && packet.advance(self.local_id.clone()).is_err() {
            return;
        }

        if handed_to_us && packet.source != from && packet.previous_hop() == Some(&from) {
            let entry = RouteEntry::via(packet.source.clone(), from.clone(), packet.hop_count, now);
            self.state
                .lock()
                .await
                .routes
                .learn(entry, self.config.route_max_age());
        }

        let ack_to = if packet.ack_requested() && handed_to_us {
            packet.previous_hop().cloned()
        } else {
            None
        };
        let message_id = packet.message_id;

        let outcome = if packet.target == self.local_id {
            self.deliver(packet, now).await
        } else {
            let retained = packet.clone();
            let outcome = self.relay(packet).await;
            if let RelayOutcome::Failed(_) = outcome {
                self.park(retained).await;
            }
            outcome
        };

        if let (Some(previous), true) = (ack_to, outcome.is_sent()) {
            let ack = ControlMessage::RelayAck {
                message_id,
                relay: self.local_id.clone(),
            };
            if let Err(e) = self.send_control(&previous, &ack).await {
                debug!("Relay ack for {} to {} failed: {}", message_id, previous, e);
            }
        }
    }

    async fn deliver(&self, packet: MeshPacket, now: Timestamp) -> RelayOutcome {
        let duplicate = self
            .state
            .lock()
            .await
            .dedup
            .check_and_add(packet.message_id, now);
        if duplicate {
            ForwarderCounters::bump(&self.counters.duplicates);
            return RelayOutcome::Dropped(DropReason::Duplicate);
        }

        ForwarderCounters::bump(&self.counters.delivered);
        info!(
            "Delivered {} from {} after {} hops",
            packet.message_id, packet.source, packet.hop_count
        );
        let message = DeliveredMessage {
            message_id: packet.message_id,
            source: packet.source,
            payload: packet.payload,
            hop_count: packet.hop_count,
            received_at: now,
        };
        if self.delivered_tx.send(message).is_err() {
            trace!("No receiver for delivered messages");
        }
        RelayOutcome::Delivered
    }

    // ------------------------------------------------------------------------
    // Control Frames
    // ------------------------------------------------------------------------

    /// Send a control frame to a software-capable peer
    pub async fn send_control(
        &self,
        to: &PeerId,
        message: &ControlMessage,
    ) -> bitrelay_core::Result<()> {
        let bytes = Frame::Control(message.clone()).encode()?;
        self.discoverer.send_direct(to, &bytes).await
    }

    async fn software_peers(&self, now: Timestamp, excluding: &[PeerId]) -> Vec<PeerId> {
        let state = self.state.lock().await;
        let mut peers: Vec<PeerId> = state
            .peers
            .values()
            .filter(|peer| peer.has_software() && self.is_viable(peer, now))
            .map(|peer| peer.peer_id.clone())
            .filter(|id| id != &self.local_id && !excluding.contains(id))
            .collect();
        peers.sort();
        peers
    }

    async fn on_control(&self, from: PeerId, message: ControlMessage, now: Timestamp) {
        trace!("{} from {}", message.kind(), from);
        match message {
            ControlMessage::RouteProbe {
                search_id,
                origin,
                target,
                path,
            } => self.on_probe(from, search_id, origin, target, path, now).await,
            ControlMessage::RouteReply {
                search_id,
                path,
                responder,
            } => self.on_reply(search_id, path, responder, now).await,
            ControlMessage::RouteAdvert { origin, neighbours } => {
                self.on_advert(from, origin, neighbours, now).await
            }
            ControlMessage::RelayAck { message_id, relay } => {
                if let Some((_, waiter)) = self.ack_waiters.remove(&message_id) {
                    let _ = waiter.send(relay);
                }
            }
        }
    }

    async fn on_probe(
        &self,
        from: PeerId,
        search_id: Uuid,
        origin: PeerId,
        target: PeerId,
        mut path: Vec<PeerId>,
        now: Timestamp,
    ) {
        if origin == self.local_id
            || path.contains(&self.local_id)
            || path.len() >= bitrelay_core::packet::MAX_ROUTE_ENTRIES
            || has_repeats(&path)
        {
            return;
        }
        {
            let mut state = self.state.lock().await;
            if state.probes.check_and_add(search_id, now) {
                return;
            }
            if let Ok(hops) = u8::try_from(path.len()) {
                if from == *path.last().unwrap_or(&origin) {
                    state.routes.learn(
                        RouteEntry::via(origin.clone(), from.clone(), hops, now),
                        self.config.route_max_age(),
                    );
                }
            }
        }
        path.push(self.local_id.clone());

        let answer = if target == self.local_id {
            Some(path.clone())
        } else {
            let state = self.state.lock().await;
            let direct = state
                .peers
                .get(&target)
                .filter(|peer| self.is_viable(peer, now))
                .is_some();
            if direct {
                let mut full = path.clone();
                full.push(target.clone());
                Some(full)
            } else {
                state
                    .routes
                    .get(&target)
                    .filter(|entry| {
                        !entry.learned_at.is_older_than(self.config.route_max_age(), now)
                    })
                    .map(|entry| {
                        let mut full = path.clone();
                        full.extend(entry.path.iter().cloned());
                        full
                    })
                    .filter(|full| !has_repeats(full))
            }
        };

        if let Some(full) = answer {
            debug!("Answering probe {} for {} with {} hops", search_id, target, full.len() - 1);
            self.on_reply(search_id, full, self.local_id.clone(), now).await;
            return;
        }

        if path.len() > self.config.max_hops as usize {
            return;
        }
        let probe = ControlMessage::RouteProbe {
            search_id,
            origin,
            target,
            path: path.clone(),
        };
        for peer in self.software_peers(now, &path).await {
            if peer == from {
                continue;
            }
            if let Err(e) = self.send_control(&peer, &probe).await {
                debug!("Probe {} to {} failed: {}", search_id, peer, e);
            }
        }
    }

    async fn on_reply(&self, search_id: Uuid, path: Vec<PeerId>, responder: PeerId, now: Timestamp) {
        let Some(index) = path.iter().position(|hop| *hop == self.local_id) else {
            return;
        };
        if has_repeats(&path) {
            return;
        }

        if index + 1 < path.len() {
            if let Some(entry) = RouteEntry::from_path(path[index + 1..].to_vec(), now) {
                self.state
                    .lock()
                    .await
                    .routes
                    .learn(entry, self.config.route_max_age());
            }
        }

        if index == 0 {
            if let Some(waiter) = self.probe_waiters.get(&search_id) {
                debug!("Route reply {} from {}: {} hops", search_id, responder, path.len() - 1);
                let _ = waiter.send(path);
            }
            return;
        }

        let back = path[index - 1].clone();
        let reply = ControlMessage::RouteReply {
            search_id,
            path,
            responder,
        };
        if let Err(e) = self.send_control(&back, &reply).await {
            debug!("Route reply {} to {} failed: {}", search_id, back, e);
        }
    }

    async fn on_advert(&self, from: PeerId, origin: PeerId, neighbours: Vec<PeerId>, now: Timestamp) {
        if origin != from {
            return;
        }
        let mut state = self.state.lock().await;
        let mut learned = 0;
        for neighbour in neighbours {
            if neighbour == self.local_id || state.peers.contains_key(&neighbour) {
                continue;
            }
            let entry = RouteEntry::via(neighbour, origin.clone(), 2, now);
            if state.routes.learn(entry, self.config.route_max_age()) {
                learned += 1;
            }
        }
        if learned > 0 {
            debug!("Learned {} routes from {}'s advert", learned, origin);
        }
    }

    /// Flood a route probe for `target` to software-capable peers
    pub async fn broadcast_probe(&self, target: &PeerId) -> RouteSearch {
        let now = self.time_source.now();
        let search_id = Uuid::new_v4();
        let (tx, replies) = mpsc::unbounded_channel();
        self.probe_waiters.insert(search_id, tx);
        self.state.lock().await.probes.mark_seen(search_id, now);

        let probe = ControlMessage::RouteProbe {
            search_id,
            origin: self.local_id.clone(),
            target: target.clone(),
            path: vec![self.local_id.clone()],
        };
        let mut probes_sent = 0;
        for peer in self.software_peers(now, &[]).await {
            match self.send_control(&peer, &probe).await {
                Ok(()) => probes_sent += 1,
                Err(e) => debug!("Probe {} to {} failed: {}", search_id, peer, e),
            }
        }
        debug!(
            "Route search {} for {} sent to {} peers",
            search_id, target, probes_sent
        );
        RouteSearch {
            search_id,
            replies,
            probes_sent,
        }
    }

    /// Stop collecting replies for a search
    pub fn cancel_probe(&self, search_id: &Uuid) {
        self.probe_waiters.remove(search_id);
    }

    /// Resolve when the first hop of `message_id` acknowledges it
    pub fn await_relay_ack(&self, message_id: Uuid) -> oneshot::Receiver<PeerId> {
        let (tx, rx) = oneshot::channel();
        self.ack_waiters.insert(message_id, tx);
        rx
    }

    pub fn cancel_relay_ack(&self, message_id: &Uuid) {
        self.ack_waiters.remove(message_id);
    }

    /// Tell software-capable neighbours which peers we reach directly
    pub async fn advertise_routes(&self) -> usize {
        if !self.config.route_adverts {
            return 0;
        }
        let now = self.time_source.now();
        let neighbours = self.software_peers(now, &[]).await;
        if neighbours.len() < 2 {
            return 0;
        }
        let advert = ControlMessage::RouteAdvert {
            origin: self.local_id.clone(),
            neighbours: neighbours.clone(),
        };
        let mut sent = 0;
        for peer in &neighbours {
            if self.send_control(peer, &advert).await.is_ok() {
                sent += 1;
            }
        }
        sent
    }

    /// Drop stale peers, routes, dedup entries and partial chunk streams
    pub async fn maintain(&self) {
        let now = self.time_source.now();
        let window = self.discovery.freshness_window();
        let (peers, routes, ids) = {
            let mut state = self.state.lock().await;
            let before = state.peers.len();
            state.peers.retain(|_, peer| peer.is_fresh(now, window));
            let peers = before - state.peers.len();
            let routes = state.routes.evict_stale(now, self.config.route_max_age());
            let ids = state.dedup.maintain(now) + state.probes.maintain(now);
            (peers, routes, ids)
        };
        let streams = self.reassembler.lock().await.evict_stale(now);
        if peers + routes + streams > 0 {
            debug!(
                "Maintenance evicted {} peers, {} routes, {} chunk streams, {} ids",
                peers, routes, streams, ids
            );
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::managers::PeerLocks;
    use bitrelay_core::{AdvertisedHints, Sighting};
    use bitrelay_harness::{AirConfig, ManualClock, VirtualAir};
    use std::time::Duration;

    struct Node {
        forwarder: MeshForwarder,
        clock: Arc<ManualClock>,
    }

    fn node(air: &VirtualAir, id: &str) -> Node {
        let clock = Arc::new(ManualClock::new(Timestamp::new(1_000_000)));
        let discoverer = Arc::new(CapabilityDiscoverer::new(
            DiscoveryConfig::testing(),
            air.radio(id),
            clock.clone(),
            Arc::new(PeerLocks::new()),
        ));
        let forwarder = MeshForwarder::new(
            PeerId::new(id),
            ForwarderConfig::testing(),
            DiscoveryConfig::testing(),
            clock.clone(),
            discoverer,
        );
        Node { forwarder, clock }
    }

    fn software_peer(id: &str, signal: i16, now: Timestamp) -> RelayPeer {
        let sighting = Sighting::new(id, AdvertisedHints::software(id), signal);
        RelayPeer::from_sighting(&sighting, now).unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_relay_is_dropped_without_transfer() {
        let air = VirtualAir::new(AirConfig::ideal());
        let _peer_radio = air.radio("B");
        air.link("A", "B", -50);
        let a = node(&air, "A");
        a.forwarder
            .on_peer_seen(software_peer("B", -50, a.clock.now()))
            .await;

        let packet = MeshPacket::new(
            PeerId::new("A"),
            PeerId::new("C"),
            b"hi".to_vec(),
            a.clock.now(),
            Duration::from_secs(60),
        );
        assert!(a.forwarder.relay(packet.clone()).await.is_sent());
        let transfers = air.transfers().len();

        let second = a.forwarder.relay(packet).await;
        assert!(matches!(second, RelayOutcome::Dropped(DropReason::Duplicate)));
        assert_eq!(air.transfers().len(), transfers);
        assert_eq!(a.forwarder.statistics().duplicates, 1);
    }

    #[tokio::test]
    async fn test_expired_packet_never_forwarded() {
        let air = VirtualAir::new(AirConfig::ideal());
        let _peer_radio = air.radio("B");
        air.link("A", "B", -50);
        let a = node(&air, "A");
        a.forwarder
            .on_peer_seen(software_peer("B", -50, a.clock.now()))
            .await;

        let packet = MeshPacket::new(
            PeerId::new("A"),
            PeerId::new("B"),
            b"late".to_vec(),
            a.clock.now(),
            Duration::from_millis(10),
        );
        a.clock.advance(Duration::from_millis(11));
        let outcome = a.forwarder.relay(packet).await;
        assert!(matches!(outcome, RelayOutcome::Dropped(DropReason::TtlExpired)));
        assert!(air.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_no_next_hop_queues_packet() {
        let air = VirtualAir::new(AirConfig::ideal());
        let a = node(&air, "A");
        let outcome = a.forwarder.send(b"later".to_vec(), PeerId::new("Z")).await;
        assert!(matches!(outcome, RelayOutcome::Queued));
        assert_eq!(a.forwarder.pending_len().await, 1);
        assert_eq!(a.forwarder.statistics().queued, 1);
    }

    #[tokio::test]
    async fn test_sweep_forwards_parked_packet_once_peer_appears() {
        let air = VirtualAir::new(AirConfig::ideal());
        let _peer_radio = air.radio("B");
        air.link("A", "B", -50);
        let a = node(&air, "A");
        let outcome = a.forwarder.send(b"later".to_vec(), PeerId::new("Z")).await;
        assert!(matches!(outcome, RelayOutcome::Queued));
        assert_eq!(a.forwarder.sweep_pending().await, 0);

        a.forwarder
            .on_peer_seen(software_peer("B", -50, a.clock.now()))
            .await;
        assert_eq!(a.forwarder.sweep_pending().await, 1);
        assert_eq!(a.forwarder.pending_len().await, 0);
        assert!(!air.transfers().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_drops_packets_past_max_age() {
        let air = VirtualAir::new(AirConfig::ideal());
        let a = node(&air, "A");
        a.forwarder.send(b"stale".to_vec(), PeerId::new("Z")).await;
        a.clock.advance(Duration::from_secs(31 * 60));

        assert_eq!(a.forwarder.sweep_pending().await, 0);
        assert_eq!(a.forwarder.pending_len().await, 0);
        assert_eq!(a.forwarder.statistics().pending_dropped, 1);
    }

    #[tokio::test]
    async fn test_software_peers_preferred_over_stronger_generic() {
        let air = VirtualAir::new(AirConfig::ideal());
        let a = node(&air, "A");
        let now = a.clock.now();
        let generic = RelayPeer::from_sighting(
            &Sighting::new("G", AdvertisedHints::new().with_name("Generic Device"), -40),
            now,
        )
        .unwrap();
        a.forwarder.on_peer_seen(generic).await;
        a.forwarder.on_peer_seen(software_peer("S", -75, now)).await;

        let ranked = a.forwarder.viable_peers().await;
        assert_eq!(ranked[0].peer_id, PeerId::new("S"));
        assert_eq!(ranked[1].peer_id, PeerId::new("G"));
    }

    #[tokio::test]
    async fn test_connected_generic_peer_ranks_by_signal_with_scanned_ones() {
        let air = VirtualAir::new(AirConfig::ideal());
        let a = node(&air, "A");
        let now = a.clock.now();
        let scanned = RelayPeer::from_sighting(
            &Sighting::new("G", AdvertisedHints::new().with_name("Generic Device"), -45),
            now,
        )
        .unwrap();
        a.forwarder.on_peer_seen(scanned).await;
        a.forwarder.on_peer_connected(PeerId::new("L"), -60).await;

        let ranked = a.forwarder.viable_peers().await;
        assert_eq!(ranked[0].peer_id, PeerId::new("G"));
        assert_eq!(ranked[1].peer_id, PeerId::new("L"));
        assert_eq!(ranked[1].hop_count, 2);
    }

    #[tokio::test]
    async fn test_disconnect_removes_peer_and_routes() {
        let air = VirtualAir::new(AirConfig::ideal());
        let a = node(&air, "A");
        a.forwarder.on_peer_connected(PeerId::new("B"), -55).await;
        assert_eq!(a.forwarder.viable_peers().await.len(), 1);

        a.forwarder.on_peer_disconnected(&PeerId::new("B")).await;
        assert!(a.forwarder.viable_peers().await.is_empty());
        assert!(a.forwarder.routes().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_frames_counted() {
        let air = VirtualAir::new(AirConfig::ideal());
        let a = node(&air, "A");
        a.forwarder
            .on_frame_received(PeerId::new("B"), vec![0x01, 0x01, 0xff])
            .await;
        assert_eq!(a.forwarder.statistics().invalid_frames, 1);
    }
}
