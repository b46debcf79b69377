//! Background tasks
//!
//! Each task owns `Arc`s to the components it drives and a shutdown watch.
//! Tasks never share writable references; they go through the components'
//! own locks.

use std::sync::Arc;

use bitrelay_core::{RadioEvent, RadioLink, Result};
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::discoverer::CapabilityDiscoverer;
use crate::forwarder::MeshForwarder;
use crate::router::SmartRouter;

/// Shutdown signal shared by all tasks
pub type ShutdownReceiver = watch::Receiver<bool>;

async fn shutdown_requested(shutdown: &mut ShutdownReceiver) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

// ----------------------------------------------------------------------------
// Scan Task
// ----------------------------------------------------------------------------

/// Feeds radio sightings into the discoverer and the forwarder's peer table
pub struct ScanTask {
    radio: Arc<dyn RadioLink>,
    discoverer: Arc<CapabilityDiscoverer>,
    forwarder: Arc<MeshForwarder>,
    shutdown: ShutdownReceiver,
}

impl ScanTask {
    pub fn new(
        radio: Arc<dyn RadioLink>,
        discoverer: Arc<CapabilityDiscoverer>,
        forwarder: Arc<MeshForwarder>,
        shutdown: ShutdownReceiver,
    ) -> Self {
        Self {
            radio,
            discoverer,
            forwarder,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Scan task starting");
        let retry_delay = self.discoverer.config().strategy_timeout();

        loop {
            let mut sightings = match self.radio.scan().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Scan failed to start: {}; retrying", e);
                    tokio::select! {
                        _ = tokio::time::sleep(retry_delay) => continue,
                        _ = shutdown_requested(&mut self.shutdown) => break,
                    }
                }
            };

            loop {
                tokio::select! {
                    next = sightings.next() => match next {
                        Some(sighting) => {
                            if let Some(peer) = self.discoverer.observe(&sighting).await {
                                self.forwarder.on_peer_seen(peer).await;
                            }
                        }
                        None => {
                            debug!("Scan stream ended; restarting");
                            break;
                        }
                    },
                    _ = shutdown_requested(&mut self.shutdown) => {
                        info!("Scan task stopped");
                        return Ok(());
                    }
                }
            }
        }

        info!("Scan task stopped");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Inbound Task
// ----------------------------------------------------------------------------

/// Dispatches radio events to the forwarder
pub struct InboundTask {
    events: BoxStream<'static, RadioEvent>,
    forwarder: Arc<MeshForwarder>,
    shutdown: ShutdownReceiver,
}

impl InboundTask {
    pub fn new(
        events: BoxStream<'static, RadioEvent>,
        forwarder: Arc<MeshForwarder>,
        shutdown: ShutdownReceiver,
    ) -> Self {
        Self {
            events,
            forwarder,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Inbound task starting");
        loop {
            tokio::select! {
                event = self.events.next() => match event {
                    Some(RadioEvent::Frame { from, bytes }) => {
                        self.forwarder.on_frame_received(from, bytes).await;
                    }
                    Some(RadioEvent::Connected { peer_id, signal_strength }) => {
                        self.forwarder.on_peer_connected(peer_id, signal_strength).await;
                    }
                    Some(RadioEvent::Disconnected { peer_id }) => {
                        self.forwarder.on_peer_disconnected(&peer_id).await;
                    }
                    None => {
                        error!("Radio event stream closed");
                        break;
                    }
                },
                _ = shutdown_requested(&mut self.shutdown) => break,
            }
        }
        info!("Inbound task stopped");
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Maintenance Tasks
// ----------------------------------------------------------------------------

/// Periodic route refresh and stale-state eviction
pub struct RefreshTask {
    router: Arc<SmartRouter>,
    shutdown: ShutdownReceiver,
}

impl RefreshTask {
    pub fn new(router: Arc<SmartRouter>, shutdown: ShutdownReceiver) -> Self {
        Self { router, shutdown }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Route refresh task starting");
        let mut interval = tokio::time::interval(self.router.config().route_refresh_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => self.router.refresh_routes().await,
                _ = shutdown_requested(&mut self.shutdown) => break,
            }
        }
        info!("Route refresh task stopped");
        Ok(())
    }
}

/// Retries the forwarder's parked packets on an interval and on new peers
pub struct PendingSweepTask {
    forwarder: Arc<MeshForwarder>,
    shutdown: ShutdownReceiver,
}

impl PendingSweepTask {
    pub fn new(forwarder: Arc<MeshForwarder>, shutdown: ShutdownReceiver) -> Self {
        Self {
            forwarder,
            shutdown,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Pending sweep task starting");
        let mut interval =
            tokio::time::interval(self.forwarder.config().pending_sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.forwarder.pending_notified() => {}
                _ = shutdown_requested(&mut self.shutdown) => break,
            }
            self.forwarder.sweep_pending().await;
        }
        info!("Pending sweep task stopped");
        Ok(())
    }
}

/// Retries the router's queued messages on a fixed interval
pub struct RetryTask {
    router: Arc<SmartRouter>,
    shutdown: ShutdownReceiver,
}

impl RetryTask {
    pub fn new(router: Arc<SmartRouter>, shutdown: ShutdownReceiver) -> Self {
        Self { router, shutdown }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Message retry task starting");
        let mut interval = tokio::time::interval(self.router.config().retry_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so fresh messages get a full interval.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let delivered = self.router.retry_pending().await;
                    if delivered > 0 {
                        debug!("Retry loop delivered {} queued messages", delivered);
                    }
                }
                _ = shutdown_requested(&mut self.shutdown) => break,
            }
        }
        info!("Message retry task stopped");
        Ok(())
    }
}
