//! Smart router
//!
//! Single entry point for sending a message to a logical destination. The
//! router gathers route candidates of four kinds, ranks them, and tries them
//! strictly one after another until one succeeds. Messages no candidate
//! could carry are parked and retried by a background loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bitrelay_core::packet::MAX_PAYLOAD_SIZE;
use bitrelay_core::{
    rank_candidates, DiscoveryConfig, PacketError, PeerId, PendingQueue, RelayError, RelayPeer,
    RoutePath, RouteKind, RouterConfig, TimeSource, Timestamp,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::discoverer::CapabilityDiscoverer;
use crate::forwarder::{MeshForwarder, RelayOutcome};
use crate::managers::RoutingStatistics;

// ----------------------------------------------------------------------------
// Router Types
// ----------------------------------------------------------------------------

/// Outcome of [`SmartRouter::route_message`]
#[derive(Debug)]
pub enum RoutingResult {
    /// Handed off along `route`
    Success { message_id: Uuid, route: RoutePath },
    /// Every candidate failed; retried in the background
    Queued { message_id: Uuid },
    /// No candidate even after route discovery
    NoRouteFound { target: PeerId },
    Error(RelayError),
}

impl RoutingResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RoutingResult::Success { .. })
    }

    pub fn message_id(&self) -> Option<Uuid> {
        match self {
            RoutingResult::Success { message_id, .. } | RoutingResult::Queued { message_id } => {
                Some(*message_id)
            }
            _ => None,
        }
    }
}

/// What the router is busy with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingStatus {
    Idle,
    Routing,
    Discovering,
}

/// A message waiting in the router's retry queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub message_id: Uuid,
    pub target: PeerId,
    pub payload: Vec<u8>,
}

enum Attempt {
    Delivered(RoutePath),
    /// The radio itself is unusable; no point trying further candidates
    Unavailable(RelayError),
    Exhausted,
}

/// Decrements an in-flight counter on drop
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn outcome_to_result(outcome: RelayOutcome) -> bitrelay_core::Result<()> {
    match outcome {
        RelayOutcome::Sent { .. } | RelayOutcome::Delivered => Ok(()),
        RelayOutcome::Failed(e) => Err(e),
        RelayOutcome::Dropped(reason) => Err(RelayError::invalid_packet(format!(
            "packet dropped: {}",
            reason.label()
        ))),
        RelayOutcome::Queued => Err(RelayError::channel_error("no next hop")),
    }
}

// ----------------------------------------------------------------------------
// Smart Router
// ----------------------------------------------------------------------------

pub struct SmartRouter {
    local_id: PeerId,
    config: RouterConfig,
    discovery: DiscoveryConfig,
    time_source: Arc<dyn TimeSource>,
    discoverer: Arc<CapabilityDiscoverer>,
    forwarder: Arc<MeshForwarder>,
    pending: Mutex<PendingQueue<OutboundMessage>>,
    route_cache: RwLock<HashMap<PeerId, Vec<RoutePath>>>,
    statistics: Mutex<RoutingStatistics>,
    routing: AtomicUsize,
    discovering: AtomicUsize,
}

impl SmartRouter {
    pub fn new(
        config: RouterConfig,
        discovery: DiscoveryConfig,
        time_source: Arc<dyn TimeSource>,
        discoverer: Arc<CapabilityDiscoverer>,
        forwarder: Arc<MeshForwarder>,
    ) -> Self {
        Self {
            local_id: forwarder.local_id().clone(),
            config,
            discovery,
            time_source,
            discoverer,
            forwarder,
            pending: Mutex::new(PendingQueue::new()),
            route_cache: RwLock::new(HashMap::new()),
            statistics: Mutex::new(RoutingStatistics::default()),
            routing: AtomicUsize::new(0),
            discovering: AtomicUsize::new(0),
        }
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn status(&self) -> RoutingStatus {
        if self.discovering.load(Ordering::SeqCst) > 0 {
            RoutingStatus::Discovering
        } else if self.routing.load(Ordering::SeqCst) > 0 {
            RoutingStatus::Routing
        } else {
            RoutingStatus::Idle
        }
    }

    // ------------------------------------------------------------------------
    // Candidates
    // ------------------------------------------------------------------------

    /// Ranked route candidates towards `target` from the current peer view
    pub async fn build_candidates(&self, target: &PeerId) -> Vec<RoutePath> {
        let peers = self.forwarder.viable_peers().await;
        let capable: Vec<&RelayPeer> = peers
            .iter()
            .filter(|peer| peer.has_software() && peer.peer_id != self.local_id)
            .collect();
        let generic: Vec<&RelayPeer> = peers
            .iter()
            .filter(|peer| {
                !peer.has_software()
                    && peer.reliability_score > self.discovery.universal_reliability_floor
            })
            .collect();

        let mut candidates = Vec::new();
        let learned = self
            .forwarder
            .routing_entry(target)
            .await
            .filter(|entry| capable.iter().any(|peer| peer.peer_id == entry.next_hop));

        match capable.iter().find(|peer| peer.peer_id == *target) {
            Some(peer) => candidates.push(RoutePath::direct(peer)),
            // Without a learned route any capable neighbour may carry it onwards.
            None if learned.is_none() => {
                candidates.extend(capable.iter().map(|peer| RoutePath::direct(peer)));
            }
            None => {}
        }

        if let Some(entry) = &learned {
            candidates.push(RoutePath::mesh_hop(entry));
        }

        candidates.extend(generic.iter().map(|peer| RoutePath::universal(peer)));

        let pairs = capable
            .iter()
            .flat_map(|c| generic.iter().map(move |g| RoutePath::hybrid(c, g)))
            .take(self.config.max_hybrid_pairs);
        candidates.extend(pairs);

        rank_candidates(candidates)
    }

    /// Cached candidates for `target`, computed on first use
    pub async fn available_routes(&self, target: &PeerId) -> Vec<RoutePath> {
        if let Some(routes) = self.route_cache.read().await.get(target) {
            return routes.clone();
        }
        let routes = self.build_candidates(target).await;
        if !routes.is_empty() {
            self.route_cache
                .write()
                .await
                .insert(target.clone(), routes.clone());
        }
        routes
    }

    /// Probe the mesh for `target` and wait for replies
    ///
    /// Waits for the first reply or the discovery timeout, then drains the
    /// replies already received. Returns the number of paths found.
    pub async fn discover_routes(&self, target: &PeerId) -> usize {
        let _discovering = InFlight::enter(&self.discovering);
        let mut search = self.forwarder.broadcast_probe(target).await;
        if search.probes_sent == 0 {
            self.forwarder.cancel_probe(&search.search_id);
            debug!("No software-capable peers to probe for {}", target);
            return 0;
        }

        let mut found = 0;
        if let Ok(Some(path)) =
            tokio::time::timeout(self.config.discovery_timeout(), search.replies.recv()).await
        {
            debug!("Discovered {}-hop path to {}", path.len() - 1, target);
            found += 1;
        }
        while search.replies.try_recv().is_ok() {
            found += 1;
        }
        self.forwarder.cancel_probe(&search.search_id);
        info!("Route discovery for {} found {} paths", target, found);
        found
    }

    // ------------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------------

    /// Route `payload` to `target` through the best available candidate
    pub async fn route_message(&self, payload: Vec<u8>, target: PeerId) -> RoutingResult {
        let _routing = InFlight::enter(&self.routing);
        let message_id = Uuid::new_v4();
        let started = self.time_source.now();
        self.statistics.lock().await.total_messages += 1;

        if target == self.local_id {
            self.statistics.lock().await.failed_messages += 1;
            return RoutingResult::Error(RelayError::invalid_packet(
                "cannot route a message to this node",
            ));
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            self.statistics.lock().await.failed_messages += 1;
            return RoutingResult::Error(
                PacketError::FieldTooLarge {
                    field: "payload",
                    max: MAX_PAYLOAD_SIZE,
                    actual: payload.len(),
                }
                .into(),
            );
        }

        let mut candidates = self.build_candidates(&target).await;
        if !reaches_target(&candidates, &target) {
            // Search the mesh before settling for any-neighbour fallbacks.
            self.discover_routes(&target).await;
            candidates = self.build_candidates(&target).await;
        }
        if candidates.is_empty() {
            self.statistics.lock().await.no_route_messages += 1;
            info!("No route to {}", target);
            return RoutingResult::NoRouteFound { target };
        }
        self.route_cache
            .write()
            .await
            .insert(target.clone(), candidates.clone());

        match self
            .attempt_all(message_id, &target, &payload, &candidates)
            .await
        {
            Attempt::Delivered(route) => {
                let latency = self.time_source.now() - started;
                self.statistics
                    .lock()
                    .await
                    .record_success(route.kind, latency);
                RoutingResult::Success { message_id, route }
            }
            Attempt::Unavailable(e) => {
                self.statistics.lock().await.failed_messages += 1;
                RoutingResult::Error(e)
            }
            Attempt::Exhausted => {
                let now = self.time_source.now();
                let message = OutboundMessage {
                    message_id,
                    target: target.clone(),
                    payload,
                };
                self.pending.lock().await.push(message_id, message, now);
                self.statistics.lock().await.queued_messages += 1;
                info!("All routes to {} failed; queued {}", target, message_id);
                RoutingResult::Queued { message_id }
            }
        }
    }

    async fn attempt_all(
        &self,
        message_id: Uuid,
        target: &PeerId,
        payload: &[u8],
        candidates: &[RoutePath],
    ) -> Attempt {
        for route in candidates {
            match self.attempt_route(message_id, target, payload, route).await {
                Ok(()) => {
                    debug!("{} to {} sent via {} route", message_id, target, route.kind);
                    return Attempt::Delivered(route.clone());
                }
                Err(e) if e.is_transport_unavailable() => {
                    warn!("Radio unavailable, aborting {}: {}", message_id, e);
                    return Attempt::Unavailable(e);
                }
                Err(e) => {
                    debug!("{} route via {:?} failed: {}", route.kind, route.first_hop(), e);
                }
            }
        }
        Attempt::Exhausted
    }

    /// Send one message along one specific route
    pub async fn attempt_route(
        &self,
        message_id: Uuid,
        target: &PeerId,
        payload: &[u8],
        route: &RoutePath,
    ) -> bitrelay_core::Result<()> {
        let Some(first_hop) = route.first_hop() else {
            return Err(RelayError::invalid_packet("route without hops"));
        };
        match route.kind {
            RouteKind::DirectCapable | RouteKind::MeshHop | RouteKind::UniversalRelay => {
                let outcome = self
                    .forwarder
                    .send_via(first_hop, message_id, target.clone(), payload.to_vec(), false)
                    .await;
                outcome_to_result(outcome)
            }
            RouteKind::Hybrid => {
                let Some(generic) = route.hops.get(1) else {
                    return Err(RelayError::invalid_packet("hybrid route needs two hops"));
                };
                self.attempt_hybrid(message_id, target, payload, first_hop, generic)
                    .await
            }
        }
    }

    /// Capable hop first, then the generic relay with the same message id
    async fn attempt_hybrid(
        &self,
        message_id: Uuid,
        target: &PeerId,
        payload: &[u8],
        capable: &PeerId,
        generic: &PeerId,
    ) -> bitrelay_core::Result<()> {
        let ack = self
            .config
            .require_relay_ack
            .then(|| self.forwarder.await_relay_ack(message_id));

        let first = self
            .forwarder
            .send_via(capable, message_id, target.clone(), payload.to_vec(), ack.is_some())
            .await;
        if let Err(e) = outcome_to_result(first) {
            self.forwarder.cancel_relay_ack(&message_id);
            return Err(e);
        }

        match ack {
            Some(ack) => {
                let limit = self.discovery.channel_timeout();
                match tokio::time::timeout(limit, ack).await {
                    Ok(Ok(relay)) => debug!("{} acknowledged {}", relay, message_id),
                    _ => {
                        self.forwarder.cancel_relay_ack(&message_id);
                        return Err(RelayError::timeout(limit.as_millis() as u64));
                    }
                }
            }
            None => tokio::time::sleep(self.config.hybrid_stage_delay()).await,
        }

        let second = self
            .forwarder
            .send_via(generic, message_id, target.clone(), payload.to_vec(), false)
            .await;
        outcome_to_result(second)
    }

    // ------------------------------------------------------------------------
    // Background Work
    // ------------------------------------------------------------------------

    /// Retry queued messages once
    ///
    /// Messages past the age limit are dropped first. A message whose retry
    /// count reaches `max_attempts` is purged and never tried again. Returns
    /// the number of messages delivered.
    pub async fn retry_pending(&self) -> usize {
        let now = self.time_source.now();
        let snapshot = {
            let mut pending = self.pending.lock().await;
            let expired = pending.expire(now, self.config.max_message_age(), self.config.max_attempts);
            if !expired.is_empty() {
                self.statistics.lock().await.dropped_messages += expired.len() as u64;
                debug!("Dropped {} queued messages past their budget", expired.len());
            }
            pending.snapshot()
        };

        let mut delivered = 0;
        for (message_id, message) in snapshot {
            if !self.pending.lock().await.contains(&message_id) {
                continue;
            }
            let candidates = self.build_candidates(&message.target).await;
            let attempt = self
                .attempt_all(message_id, &message.target, &message.payload, &candidates)
                .await;

            match attempt {
                Attempt::Delivered(route) => {
                    let mut pending = self.pending.lock().await;
                    let enqueued_at = pending
                        .get(&message_id)
                        .map(|entry| entry.enqueued_at)
                        .unwrap_or(now);
                    pending.remove(&message_id);
                    drop(pending);

                    let latency = self.time_source.now() - enqueued_at;
                    self.statistics
                        .lock()
                        .await
                        .record_success(route.kind, latency);
                    info!("Queued {} delivered via {} route", message_id, route.kind);
                    delivered += 1;
                }
                Attempt::Unavailable(_) | Attempt::Exhausted => {
                    let mut pending = self.pending.lock().await;
                    if let Some(retries) = pending.record_failure(&message_id) {
                        if retries >= self.config.max_attempts {
                            pending.remove(&message_id);
                            drop(pending);
                            self.statistics.lock().await.dropped_messages += 1;
                            warn!(
                                "Giving up on {} to {} after {} attempts",
                                message_id, message.target, retries
                            );
                        }
                    }
                }
            }
        }
        delivered
    }

    /// Rebuild cached candidates and evict stale peer and route state
    pub async fn refresh_routes(&self) {
        self.discoverer.evict_stale().await;
        self.forwarder.maintain().await;
        self.forwarder.advertise_routes().await;

        let mut targets: Vec<PeerId> = self.route_cache.read().await.keys().cloned().collect();
        for (_, message) in self.pending.lock().await.snapshot() {
            if !targets.contains(&message.target) {
                targets.push(message.target);
            }
        }

        let mut refreshed = HashMap::new();
        for target in targets {
            let routes = self.build_candidates(&target).await;
            if !routes.is_empty() {
                refreshed.insert(target, routes);
            }
        }
        debug!("Refreshed routes for {} targets", refreshed.len());
        *self.route_cache.write().await = refreshed;
    }

    /// Remove a queued message; returns false if it was not queued
    pub async fn withdraw(&self, message_id: &Uuid) -> bool {
        let removed = self.pending.lock().await.remove(message_id).is_some();
        if removed {
            info!("Withdrew {}", message_id);
        }
        removed
    }

    pub async fn pending_messages(&self) -> Vec<OutboundMessage> {
        self.pending
            .lock()
            .await
            .snapshot()
            .into_iter()
            .map(|(_, message)| message)
            .collect()
    }

    /// Router statistics with the forwarder's counters attached
    pub async fn statistics(&self) -> RoutingStatistics {
        let mut statistics = self.statistics.lock().await.clone();
        statistics.forwarder = self.forwarder.statistics();
        statistics
    }

    /// When the message was first accepted, if it is still queued
    pub async fn queued_since(&self, message_id: &Uuid) -> Option<Timestamp> {
        self.pending
            .lock()
            .await
            .get(message_id)
            .map(|entry| entry.enqueued_at)
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

/// A candidate that is the target itself or a learned path to it
fn reaches_target(candidates: &[RoutePath], target: &PeerId) -> bool {
    candidates.iter().any(|route| match route.kind {
        RouteKind::MeshHop => true,
        RouteKind::DirectCapable => route.hops.len() == 1 && route.first_hop() == Some(target),
        _ => false,
    })
}
