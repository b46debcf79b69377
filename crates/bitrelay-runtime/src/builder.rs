//! Runtime Builder API
//!
//! Wires a radio link, configuration and clock into the discoverer,
//! forwarder and router, then starts the background tasks.

use std::sync::Arc;

use bitrelay_core::{AdvertisedHints, RadioLink, RelayConfig, Result, SystemTimeSource, TimeSource};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::discoverer::CapabilityDiscoverer;
use crate::forwarder::MeshForwarder;
use crate::managers::PeerLocks;
use crate::router::SmartRouter;
use crate::runtime::RelayRuntime;
use crate::tasks::{InboundTask, PendingSweepTask, RefreshTask, RetryTask, ScanTask};

// ----------------------------------------------------------------------------
// Runtime Builder
// ----------------------------------------------------------------------------

/// Builder for a relay node running on one radio link
pub struct RuntimeBuilder {
    radio: Arc<dyn RadioLink>,
    config: RelayConfig,
    time_source: Arc<dyn TimeSource>,
    display_name: Option<String>,
    scanner: bool,
}

impl RuntimeBuilder {
    /// Create a builder with default configuration and the system clock
    pub fn new(radio: Arc<dyn RadioLink>) -> Self {
        Self {
            radio,
            config: RelayConfig::default(),
            time_source: Arc::new(SystemTimeSource),
            display_name: None,
            scanner: true,
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    /// Use another clock, e.g. a manual one in tests
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }

    /// Name advertised alongside our presence hints
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Do not start the scan task; peers must be fed in by hand
    pub fn without_scanner(mut self) -> Self {
        self.scanner = false;
        self
    }

    /// Build the components, advertise presence and start all tasks
    pub async fn build_and_start(self) -> Result<RelayRuntime> {
        self.config.validate()?;
        let local_id = self.radio.local_id();
        info!("Building relay runtime for {}", local_id);

        let locks = Arc::new(PeerLocks::new());
        let discoverer = Arc::new(CapabilityDiscoverer::new(
            self.config.discovery.clone(),
            Arc::clone(&self.radio),
            Arc::clone(&self.time_source),
            locks,
        ));
        let forwarder = Arc::new(MeshForwarder::new(
            local_id.clone(),
            self.config.forwarder.clone(),
            self.config.discovery.clone(),
            Arc::clone(&self.time_source),
            Arc::clone(&discoverer),
        ));
        let router = Arc::new(SmartRouter::new(
            self.config.router.clone(),
            self.config.discovery.clone(),
            Arc::clone(&self.time_source),
            Arc::clone(&discoverer),
            Arc::clone(&forwarder),
        ));

        let name = self
            .display_name
            .unwrap_or_else(|| local_id.to_string());
        if let Err(e) = self
            .radio
            .advertise_presence(AdvertisedHints::software(&name))
            .await
        {
            warn!("Could not advertise presence: {}", e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut handles = Vec::new();

        if self.scanner {
            let mut task = ScanTask::new(
                Arc::clone(&self.radio),
                Arc::clone(&discoverer),
                Arc::clone(&forwarder),
                shutdown_rx.clone(),
            );
            handles.push(tokio::spawn(async move { task.run().await }));
        }

        match self.radio.take_events() {
            Some(events) => {
                let mut task =
                    InboundTask::new(events, Arc::clone(&forwarder), shutdown_rx.clone());
                handles.push(tokio::spawn(async move { task.run().await }));
            }
            None => warn!("Radio events already taken; inbound frames will not be handled"),
        }

        let mut refresh = RefreshTask::new(Arc::clone(&router), shutdown_rx.clone());
        handles.push(tokio::spawn(async move { refresh.run().await }));

        let mut sweep = PendingSweepTask::new(Arc::clone(&forwarder), shutdown_rx.clone());
        handles.push(tokio::spawn(async move { sweep.run().await }));

        let mut retry = RetryTask::new(Arc::clone(&router), shutdown_rx);
        handles.push(tokio::spawn(async move { retry.run().await }));

        info!("Relay runtime {} started with {} tasks", local_id, handles.len());

        Ok(RelayRuntime::new(
            local_id,
            self.radio,
            discoverer,
            forwarder,
            router,
            shutdown_tx,
            handles,
        ))
    }
}
