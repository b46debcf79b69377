//! Mesh packets, control messages and their wire format
//!
//! Every frame on the air shares one envelope:
//!
//! ```text
//! version(1) | frame_type(1) | body | crc32(4, BE)
//! ```
//!
//! Data bodies use a fixed, length-prefixed layout so every node encodes a
//! [`MeshPacket`] identically:
//!
//! ```text
//! message_id(16) | flags(1) | hop_count(1) | ttl_deadline(8, BE ms)
//! | source_len(1) source | target_len(1) target
//! | route_count(1) { hop_len(1) hop }* | payload_len(4, BE) payload
//! ```
//!
//! Control bodies are a `u32` length followed by a bincode-encoded
//! [`ControlMessage`].

use alloc::vec::Vec;
use core::time::Duration;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{PacketError, RelayError, Result};
use crate::types::{PeerId, Timestamp, MAX_PEER_ID_LEN};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Current wire format version
pub const WIRE_VERSION: u8 = 1;

/// Frame type for data packets
pub const FRAME_DATA: u8 = 1;
/// Frame type for control messages
pub const FRAME_CONTROL: u8 = 2;

/// Maximum number of entries in `route_taken`
pub const MAX_ROUTE_ENTRIES: usize = 32;

/// Maximum payload size accepted on the wire
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Flag: the receiving hop should acknowledge that it handled the packet
pub const FLAG_ACK_REQUESTED: u8 = 0x01;

const CHECKSUM_SIZE: usize = 4;
const ENVELOPE_HEADER_SIZE: usize = 2;

// ----------------------------------------------------------------------------
// Mesh Packet
// ----------------------------------------------------------------------------

/// A message travelling hop-by-hop through the mesh
///
/// Only `hop_count` and `route_taken` change in transit, each growing by
/// exactly one per hop through [`MeshPacket::advance`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshPacket {
    pub message_id: Uuid,
    pub source: PeerId,
    pub target: PeerId,
    pub payload: Vec<u8>,
    pub hop_count: u8,
    pub ttl_deadline: Timestamp,
    /// Origin first, current holder last
    pub route_taken: Vec<PeerId>,
    pub flags: u8,
}

impl MeshPacket {
    /// Create a freshly originated packet
    pub fn new(source: PeerId, target: PeerId, payload: Vec<u8>, now: Timestamp, ttl: Duration) -> Self {
        Self::with_id(Uuid::new_v4(), source, target, payload, now, ttl)
    }

    /// Create a freshly originated packet with a caller-chosen id
    pub fn with_id(
        message_id: Uuid,
        source: PeerId,
        target: PeerId,
        payload: Vec<u8>,
        now: Timestamp,
        ttl: Duration,
    ) -> Self {
        Self {
            message_id,
            route_taken: vec![source.clone()],
            source,
            target,
            payload,
            hop_count: 0,
            ttl_deadline: now + ttl,
            flags: 0,
        }
    }

    /// Ask the next hop to acknowledge handling
    pub fn with_ack_requested(mut self) -> Self {
        self.flags |= FLAG_ACK_REQUESTED;
        self
    }

    pub fn ack_requested(&self) -> bool {
        self.flags & FLAG_ACK_REQUESTED != 0
    }

    /// Whether the TTL deadline has passed
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.ttl_deadline
    }

    /// Whether forwarding must stop at `max_hops`
    pub fn hop_limit_reached(&self, max_hops: u8) -> bool {
        self.hop_count >= max_hops
    }

    pub fn has_visited(&self, peer: &PeerId) -> bool {
        self.route_taken.contains(peer)
    }

    /// The peer that handed this packet to its current holder
    pub fn previous_hop(&self) -> Option<&PeerId> {
        let len = self.route_taken.len();
        if len >= 2 {
            self.route_taken.get(len - 2)
        } else {
            None
        }
    }

    /// Record one more hop towards `next_hop`
    pub fn advance(&mut self, next_hop: PeerId) -> core::result::Result<(), PacketError> {
        if self.has_visited(&next_hop) {
            return Err(PacketError::RouteLoop {
                peer_id: next_hop.to_string(),
            });
        }
        self.hop_count = self.hop_count.saturating_add(1);
        self.route_taken.push(next_hop);
        Ok(())
    }

    /// Validate structural invariants
    pub fn validate(&self) -> core::result::Result<(), PacketError> {
        if self.payload.len() > MAX_PAYLOAD_SIZE {
            return Err(PacketError::FieldTooLarge {
                field: "payload",
                max: MAX_PAYLOAD_SIZE,
                actual: self.payload.len(),
            });
        }
        if self.route_taken.len() > MAX_ROUTE_ENTRIES {
            return Err(PacketError::FieldTooLarge {
                field: "route_taken",
                max: MAX_ROUTE_ENTRIES,
                actual: self.route_taken.len(),
            });
        }
        for (index, hop) in self.route_taken.iter().enumerate() {
            if self.route_taken[..index].contains(hop) {
                return Err(PacketError::RouteLoop {
                    peer_id: hop.to_string(),
                });
            }
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Control Messages
// ----------------------------------------------------------------------------

/// Mesh-internal signalling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Flooded search for a path to `target`
    RouteProbe {
        search_id: Uuid,
        origin: PeerId,
        target: PeerId,
        /// Peers the probe has visited, origin first
        path: Vec<PeerId>,
    },
    /// Answer to a probe, echoed back along the reversed path
    RouteReply {
        search_id: Uuid,
        /// Full path from origin to target
        path: Vec<PeerId>,
        responder: PeerId,
    },
    /// A node's direct neighbours
    RouteAdvert {
        origin: PeerId,
        neighbours: Vec<PeerId>,
    },
    /// A hop confirms it handled a packet that requested acknowledgement
    RelayAck { message_id: Uuid, relay: PeerId },
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::RouteProbe { .. } => "route-probe",
            ControlMessage::RouteReply { .. } => "route-reply",
            ControlMessage::RouteAdvert { .. } => "route-advert",
            ControlMessage::RelayAck { .. } => "relay-ack",
        }
    }
}

// ----------------------------------------------------------------------------
// Frame Codec
// ----------------------------------------------------------------------------

/// Anything that can travel inside the wire envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(MeshPacket),
    Control(ControlMessage),
}

impl Frame {
    /// Encode into the checksummed wire envelope
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::with_capacity(128);
        bytes.push(WIRE_VERSION);
        match self {
            Frame::Data(packet) => {
                bytes.push(FRAME_DATA);
                encode_packet(packet, &mut bytes)?;
            }
            Frame::Control(message) => {
                bytes.push(FRAME_CONTROL);
                let body = bincode::serialize(message)?;
                bytes.extend_from_slice(&(body.len() as u32).to_be_bytes());
                bytes.extend_from_slice(&body);
            }
        }
        let checksum = crc32fast::hash(&bytes);
        bytes.extend_from_slice(&checksum.to_be_bytes());
        Ok(bytes)
    }

    /// Decode and verify a wire envelope
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let minimum = ENVELOPE_HEADER_SIZE + CHECKSUM_SIZE;
        if bytes.len() < minimum {
            return Err(PacketError::TooShort {
                expected: minimum,
                actual: bytes.len(),
            }
            .into());
        }

        let (content, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(content) != expected {
            return Err(PacketError::ChecksumFailed.into());
        }

        if content[0] != WIRE_VERSION {
            return Err(PacketError::UnsupportedVersion {
                version: content[0],
            }
            .into());
        }

        let mut reader = WireReader::new(&content[ENVELOPE_HEADER_SIZE..]);
        let frame = match content[1] {
            FRAME_DATA => Frame::Data(decode_packet(&mut reader)?),
            FRAME_CONTROL => {
                let len = reader.u32()? as usize;
                let body = reader.take(len)?;
                Frame::Control(bincode::deserialize(body)?)
            }
            other => {
                return Err(PacketError::UnknownFrameType { frame_type: other }.into());
            }
        };
        reader.finish()?;
        Ok(frame)
    }
}

impl From<MeshPacket> for Frame {
    fn from(packet: MeshPacket) -> Self {
        Frame::Data(packet)
    }
}

impl From<ControlMessage> for Frame {
    fn from(message: ControlMessage) -> Self {
        Frame::Control(message)
    }
}

fn encode_packet(packet: &MeshPacket, bytes: &mut Vec<u8>) -> Result<()> {
    packet.validate()?;

    bytes.extend_from_slice(packet.message_id.as_bytes());
    bytes.push(packet.flags);
    bytes.push(packet.hop_count);
    bytes.extend_from_slice(&packet.ttl_deadline.as_millis().to_be_bytes());
    put_peer(bytes, "source", &packet.source)?;
    put_peer(bytes, "target", &packet.target)?;
    bytes.push(packet.route_taken.len() as u8);
    for hop in &packet.route_taken {
        put_peer(bytes, "route_taken", hop)?;
    }
    bytes.extend_from_slice(&(packet.payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&packet.payload);
    Ok(())
}

fn decode_packet(reader: &mut WireReader<'_>) -> Result<MeshPacket> {
    let message_id = reader.uuid()?;
    let flags = reader.u8()?;
    let hop_count = reader.u8()?;
    let ttl_deadline = Timestamp::new(reader.u64()?);
    let source = reader.peer()?;
    let target = reader.peer()?;

    let route_count = reader.u8()? as usize;
    if route_count > MAX_ROUTE_ENTRIES {
        return Err(PacketError::FieldTooLarge {
            field: "route_taken",
            max: MAX_ROUTE_ENTRIES,
            actual: route_count,
        }
        .into());
    }
    let mut route_taken = Vec::with_capacity(route_count);
    for _ in 0..route_count {
        route_taken.push(reader.peer()?);
    }

    let payload_len = reader.u32()? as usize;
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(PacketError::FieldTooLarge {
            field: "payload",
            max: MAX_PAYLOAD_SIZE,
            actual: payload_len,
        }
        .into());
    }
    let payload = reader.take(payload_len)?.to_vec();

    let packet = MeshPacket {
        message_id,
        source,
        target,
        payload,
        hop_count,
        ttl_deadline,
        route_taken,
        flags,
    };
    packet.validate()?;
    Ok(packet)
}

fn put_peer(bytes: &mut Vec<u8>, field: &'static str, peer: &PeerId) -> Result<()> {
    let raw = peer.as_bytes();
    if raw.is_empty() || raw.len() > MAX_PEER_ID_LEN {
        return Err(PacketError::FieldTooLarge {
            field,
            max: MAX_PEER_ID_LEN,
            actual: raw.len(),
        }
        .into());
    }
    bytes.push(raw.len() as u8);
    bytes.extend_from_slice(raw);
    Ok(())
}

/// Bounds-checked cursor over a frame body
struct WireReader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> WireReader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn take(&mut self, len: usize) -> core::result::Result<&'a [u8], PacketError> {
        let end = self.offset.checked_add(len).ok_or(PacketError::TooShort {
            expected: usize::MAX,
            actual: self.bytes.len(),
        })?;
        if end > self.bytes.len() {
            return Err(PacketError::TooShort {
                expected: end,
                actual: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.offset..end];
        self.offset = end;
        Ok(slice)
    }

    fn u8(&mut self) -> core::result::Result<u8, PacketError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> core::result::Result<u32, PacketError> {
        let raw = self.take(4)?;
        Ok(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn u64(&mut self) -> core::result::Result<u64, PacketError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(buf))
    }

    fn uuid(&mut self) -> core::result::Result<Uuid, PacketError> {
        let mut buf = [0u8; 16];
        buf.copy_from_slice(self.take(16)?);
        Ok(Uuid::from_bytes(buf))
    }

    fn peer(&mut self) -> core::result::Result<PeerId, PacketError> {
        let len = self.u8()? as usize;
        PeerId::from_wire(self.take(len)?)
    }

    fn finish(&self) -> core::result::Result<(), PacketError> {
        if self.offset != self.bytes.len() {
            return Err(PacketError::Generic {
                message: format!("{} trailing bytes", self.bytes.len() - self.offset),
            });
        }
        Ok(())
    }
}

/// Decode a frame that must carry a data packet
pub fn decode_packet_frame(bytes: &[u8]) -> Result<MeshPacket> {
    match Frame::decode(bytes)? {
        Frame::Data(packet) => Ok(packet),
        Frame::Control(message) => Err(RelayError::invalid_packet(format!(
            "Expected data frame, got {}",
            message.kind()
        ))),
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
