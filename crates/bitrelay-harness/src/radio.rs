//! Simulated radio implementing the engine's radio contract

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bitrelay_core::capability::GENERIC_RELAY_SERVICE;
use bitrelay_core::chunking::decode_identifier;
use bitrelay_core::{
    AdvertisedHints, AdvertisementPayload, PeerId, RadioChannel, RadioEvent, RadioLink,
    RelayError, Result, Sighting, TransportStrategy,
};
use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::air::{TransferRecord, VirtualAir};

fn advertisement_label(payload: &AdvertisementPayload) -> &'static str {
    match payload {
        AdvertisementPayload::LocalName(_) => "identifier-encoding",
        AdvertisementPayload::ManufacturerData { .. } => "manufacturer-data",
        AdvertisementPayload::ServiceData { service, .. } if *service == GENERIC_RELAY_SERVICE => {
            "broadcast-chunking"
        }
        AdvertisementPayload::ServiceData { .. } => "service-data",
    }
}

// ----------------------------------------------------------------------------
// Simulated Radio
// ----------------------------------------------------------------------------

/// A node's radio on the [`VirtualAir`]
#[derive(Debug)]
pub struct SimulatedRadio {
    id: PeerId,
    air: VirtualAir,
    events: Mutex<Option<mpsc::UnboundedReceiver<RadioEvent>>>,
}

impl SimulatedRadio {
    pub(crate) fn new(
        id: PeerId,
        air: VirtualAir,
        events: mpsc::UnboundedReceiver<RadioEvent>,
    ) -> Self {
        Self {
            id,
            air,
            events: Mutex::new(Some(events)),
        }
    }

    /// Medium this radio is attached to
    pub fn air(&self) -> &VirtualAir {
        &self.air
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.air.state().is_disabled(&self.id) {
            return Err(RelayError::transport_unavailable(format!(
                "radio of {} is disabled",
                self.id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl RadioLink for SimulatedRadio {
    fn local_id(&self) -> PeerId {
        self.id.clone()
    }

    async fn scan(&self) -> Result<BoxStream<'static, Sighting>> {
        self.ensure_enabled()?;
        let air = self.air.clone();
        let observer = self.id.clone();
        let interval = air.config.scan_interval;

        let rounds = stream::unfold((air, observer), move |(air, observer)| async move {
            tokio::time::sleep(interval).await;
            let sightings = if air.state().is_disabled(&observer) {
                Vec::new()
            } else {
                air.state().sightings_for(&observer)
            };
            Some((stream::iter(sightings), (air, observer)))
        });
        Ok(rounds.flatten().boxed())
    }

    async fn advertise_presence(&self, hints: AdvertisedHints) -> Result<()> {
        self.ensure_enabled()?;
        if let Some(device) = self.air.state().devices.get_mut(&self.id) {
            device.hints = Some(hints);
        }
        debug!("Simulated radio {}: advertising presence", self.id);
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<()> {
        if let Some(device) = self.air.state().devices.get_mut(&self.id) {
            device.hints = None;
        }
        debug!("Simulated radio {}: stopped advertising", self.id);
        Ok(())
    }

    async fn open_channel(
        &self,
        peer: &PeerId,
        strategy: &TransportStrategy,
    ) -> Result<Box<dyn RadioChannel>> {
        self.ensure_enabled()?;
        let mut state = self.air.state();
        state.channel_opens += 1;

        if !state.devices.contains_key(peer) || state.signal(&self.id, peer).is_none() {
            return Err(RelayError::peer_not_found(peer));
        }
        if state.link_fails(&self.id, peer) {
            return Err(RelayError::connection_failed(peer, "link failure injected"));
        }
        if state.strategy_fails(&self.id, strategy.label()) {
            return Err(RelayError::connection_failed(
                peer,
                format!("{} rejected", strategy.label()),
            ));
        }

        Ok(Box::new(SimulatedChannel {
            from: self.id.clone(),
            to: peer.clone(),
            strategy: strategy.label(),
            air: self.air.clone(),
            open: true,
        }))
    }

    async fn emit_advertisement(
        &self,
        payload: AdvertisementPayload,
        window: Duration,
    ) -> Result<()> {
        self.ensure_enabled()?;
        let label = advertisement_label(&payload);
        if self.air.state().strategy_fails(&self.id, label) {
            return Err(RelayError::send_failed(&self.id, format!("{} rejected", label)));
        }

        let bytes = match &payload {
            AdvertisementPayload::LocalName(name) => decode_identifier(name),
            AdvertisementPayload::ManufacturerData { data, .. } => Some(data.clone()),
            AdvertisementPayload::ServiceData { data, .. } => Some(data.clone()),
        };

        let lost = self.air.should_drop();
        let latency = self.air.config.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.air.state();
        let mut delivered = false;
        if let (Some(bytes), false) = (bytes, lost) {
            for (neighbour, _) in state.neighbours(&self.id) {
                delivered |= state.deliver(&neighbour, &self.id, bytes.clone());
            }
        }
        state.transfers.push(TransferRecord {
            from: self.id.clone(),
            to: None,
            strategy: label,
            bytes: payload.data_len(),
            delivered,
        });
        trace!(
            "Simulated radio {}: {} advertisement for {:?}",
            self.id,
            label,
            window
        );
        Ok(())
    }

    fn take_events(&self) -> Option<BoxStream<'static, RadioEvent>> {
        let receiver = self
            .events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()?;
        Some(
            stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|event| (event, receiver))
            })
            .boxed(),
        )
    }
}

// ----------------------------------------------------------------------------
// Simulated Channel
// ----------------------------------------------------------------------------

struct SimulatedChannel {
    from: PeerId,
    to: PeerId,
    strategy: &'static str,
    air: VirtualAir,
    open: bool,
}

#[async_trait]
impl RadioChannel for SimulatedChannel {
    fn peer_id(&self) -> &PeerId {
        &self.to
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if !self.open {
            return Err(RelayError::send_failed(&self.to, "channel closed"));
        }
        let lost = self.air.should_drop();
        let latency = self.air.config.latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.air.state();
        if state.is_disabled(&self.from) {
            return Err(RelayError::transport_unavailable("radio disabled mid-transfer"));
        }
        if state.signal(&self.from, &self.to).is_none() {
            return Err(RelayError::send_failed(&self.to, "peer out of range"));
        }

        let delivered = !lost && state.deliver_write(&self.from, &self.to, bytes);
        state.transfers.push(TransferRecord {
            from: self.from.clone(),
            to: Some(self.to.clone()),
            strategy: self.strategy,
            bytes: bytes.len(),
            delivered,
        });
        drop(state);

        if lost {
            return Err(RelayError::send_failed(&self.to, "frame lost"));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
