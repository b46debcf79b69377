//! Relay runtime handle
//!
//! The application-facing surface of a running node: route messages,
//! receive messages addressed to us, inspect relay-capable devices,
//! statistics and routes, withdraw queued messages, shut down.

use std::sync::Arc;

use bitrelay_core::{
    PeerId, RadioLink, RelayCapableDevice, RelayError, RelayPeer, Result, RoutePath, Sighting,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::discoverer::CapabilityDiscoverer;
use crate::forwarder::{DeliveredMessage, MeshForwarder};
use crate::managers::RoutingStatistics;
use crate::router::{RoutingResult, RoutingStatus, SmartRouter};

// ----------------------------------------------------------------------------
// Relay Runtime
// ----------------------------------------------------------------------------

/// Handle to a running relay node
pub struct RelayRuntime {
    local_id: PeerId,
    radio: Arc<dyn RadioLink>,
    discoverer: Arc<CapabilityDiscoverer>,
    forwarder: Arc<MeshForwarder>,
    router: Arc<SmartRouter>,
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<Result<()>>>,
}

impl RelayRuntime {
    pub(crate) fn new(
        local_id: PeerId,
        radio: Arc<dyn RadioLink>,
        discoverer: Arc<CapabilityDiscoverer>,
        forwarder: Arc<MeshForwarder>,
        router: Arc<SmartRouter>,
        shutdown: watch::Sender<bool>,
        handles: Vec<JoinHandle<Result<()>>>,
    ) -> Self {
        Self {
            local_id,
            radio,
            discoverer,
            forwarder,
            router,
            shutdown,
            handles,
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    /// Route a message to `target` through one bounded routing cycle
    pub async fn route_message(&self, payload: Vec<u8>, target: PeerId) -> RoutingResult {
        self.router.route_message(payload, target).await
    }

    /// Feed a sighting in by hand, as the scan task does
    pub async fn observe(&self, sighting: &Sighting) -> Option<RelayPeer> {
        let peer = self.discoverer.observe(sighting).await?;
        self.forwarder.on_peer_seen(peer.clone()).await;
        Some(peer)
    }

    /// Snapshot of viable relay-capable devices, best first
    pub async fn discover_relay_capable_devices(&self) -> Vec<RelayCapableDevice> {
        self.discoverer.relay_capable_devices().await
    }

    pub async fn statistics(&self) -> RoutingStatistics {
        self.router.statistics().await
    }

    pub fn status(&self) -> RoutingStatus {
        self.router.status()
    }

    pub async fn available_routes(&self, target: &PeerId) -> Vec<RoutePath> {
        self.router.available_routes(target).await
    }

    /// Stop retrying a queued message
    pub async fn withdraw(&self, message_id: &Uuid) -> bool {
        self.router.withdraw(message_id).await
    }

    /// Messages addressed to this node; can be taken once
    pub fn take_message_receiver(&self) -> Option<mpsc::UnboundedReceiver<DeliveredMessage>> {
        self.forwarder.take_message_receiver()
    }

    pub fn discoverer(&self) -> &Arc<CapabilityDiscoverer> {
        &self.discoverer
    }

    pub fn forwarder(&self) -> &Arc<MeshForwarder> {
        &self.forwarder
    }

    pub fn router(&self) -> &Arc<SmartRouter> {
        &self.router
    }

    pub fn is_running(&self) -> bool {
        self.handles.iter().any(|handle| !handle.is_finished())
    }

    /// Stop advertising, signal every task and wait for them to finish
    pub async fn shutdown(&mut self) -> Result<()> {
        info!("Shutting down relay runtime {}", self.local_id);
        if let Err(e) = self.radio.stop_advertising().await {
            warn!("Could not stop advertising: {}", e);
        }
        let _ = self.shutdown.send(true);

        let mut first_error = None;
        for handle in self.handles.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Task ended with error: {}", e);
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(RelayError::channel_error(format!(
                        "Task panicked: {}",
                        e
                    )));
                }
            }
        }
        info!("Relay runtime {} stopped", self.local_id);
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for RelayRuntime {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
