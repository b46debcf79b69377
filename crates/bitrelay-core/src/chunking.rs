//! Chunking and strategy encodings for constrained links
//!
//! Broadcast and advertisement-borrowing strategies can only move a handful
//! of bytes per frame. Payloads larger than [`SINGLE_FRAME_LIMIT`] are split
//! into chunks carrying a 3-byte header:
//!
//! ```text
//! magic(0xBC) | index(1) | count(1) | data(<= CHUNK_DATA_SIZE)
//! ```
//!
//! Only peers running this software reassemble; chunks sent to generic
//! devices are best effort.

use core::time::Duration;
use alloc::string::String;
use alloc::vec::Vec;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use hashbrown::HashMap;

use crate::errors::PacketError;
use crate::types::{PeerId, Timestamp};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Magic byte opening every chunk
pub const CHUNK_MAGIC: u8 = 0xBC;

/// Size of the chunk header
pub const CHUNK_HEADER_SIZE: usize = 3;

/// Data bytes per broadcast chunk
pub const CHUNK_DATA_SIZE: usize = 18;

/// Payloads up to this size travel in one frame without a chunk header
pub const SINGLE_FRAME_LIMIT: usize = 20;

/// Maximum chunks per payload
pub const MAX_CHUNKS: usize = u8::MAX as usize;

/// Prefix of an identifier-encoded chunk
pub const IDENTIFIER_PREFIX: &str = "BC_";

/// Longest identifier a peer is expected to accept
pub const MAX_IDENTIFIER_LEN: usize = 20;

/// Data bytes per identifier chunk, sized so prefix plus base64 fits
pub const IDENTIFIER_DATA_SIZE: usize = 9;

/// Company id borrowed for manufacturer-data hijacking
pub const HIJACK_COMPANY_ID: u16 = 0xFFFF;

/// Envelope opener for writes to generic structured channels
pub const STRUCTURED_ENVELOPE_MAGIC: [u8; 2] = [0x01, 0x02];

/// Partial reassemblies older than this are discarded
pub const REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(30);

// ----------------------------------------------------------------------------
// Chunking
// ----------------------------------------------------------------------------

/// Split a payload into frames of at most `data_size` data bytes
///
/// Payloads within [`SINGLE_FRAME_LIMIT`] are returned as a single
/// unheadered frame.
pub fn chunk_payload(payload: &[u8], data_size: usize) -> Result<Vec<Vec<u8>>, PacketError> {
    if payload.len() <= SINGLE_FRAME_LIMIT.min(data_size + CHUNK_HEADER_SIZE) {
        return Ok(vec![payload.to_vec()]);
    }
    let data_size = data_size.max(1);
    let count = payload.len().div_ceil(data_size);
    if count > MAX_CHUNKS {
        return Err(PacketError::FieldTooLarge {
            field: "chunk_count",
            max: MAX_CHUNKS,
            actual: count,
        });
    }
    Ok(payload
        .chunks(data_size)
        .enumerate()
        .map(|(index, data)| {
            let mut chunk = Vec::with_capacity(CHUNK_HEADER_SIZE + data.len());
            chunk.push(CHUNK_MAGIC);
            chunk.push(index as u8);
            chunk.push(count as u8);
            chunk.extend_from_slice(data);
            chunk
        })
        .collect())
}

/// Header of a chunk, if the frame is one
pub fn parse_chunk_header(frame: &[u8]) -> Option<(u8, u8)> {
    if frame.len() < CHUNK_HEADER_SIZE || frame[0] != CHUNK_MAGIC {
        return None;
    }
    let (index, count) = (frame[1], frame[2]);
    if count == 0 || index >= count {
        return None;
    }
    Some((index, count))
}

// ----------------------------------------------------------------------------
// Strategy Encodings
// ----------------------------------------------------------------------------

/// Encode a chunk as an advertised identifier
pub fn encode_identifier(chunk: &[u8]) -> Result<String, PacketError> {
    let name = format!("{}{}", IDENTIFIER_PREFIX, STANDARD_NO_PAD.encode(chunk));
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(PacketError::FieldTooLarge {
            field: "identifier",
            max: MAX_IDENTIFIER_LEN,
            actual: name.len(),
        });
    }
    Ok(name)
}

/// Decode an identifier produced by [`encode_identifier`]
pub fn decode_identifier(name: &str) -> Option<Vec<u8>> {
    let encoded = name.strip_prefix(IDENTIFIER_PREFIX)?;
    STANDARD_NO_PAD.decode(encoded).ok()
}

/// Wrap bytes for a write to a generic structured channel
pub fn structured_envelope(payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    if payload.len() > u16::MAX as usize {
        return Err(PacketError::FieldTooLarge {
            field: "structured_payload",
            max: u16::MAX as usize,
            actual: payload.len(),
        });
    }
    let mut bytes = Vec::with_capacity(payload.len() + 4);
    bytes.extend_from_slice(&STRUCTURED_ENVELOPE_MAGIC);
    bytes.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Unwrap a structured-channel envelope, or return the bytes unchanged
pub fn open_structured_envelope(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= 4 && bytes[..2] == STRUCTURED_ENVELOPE_MAGIC {
        let len = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if bytes.len() == 4 + len {
            return &bytes[4..];
        }
    }
    bytes
}

// ----------------------------------------------------------------------------
// Reassembly
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct PartialPayload {
    parts: Vec<Option<Vec<u8>>>,
    received: usize,
    started_at: Timestamp,
}

/// Receiver-side reassembly of chunked payloads, one stream per sender
#[derive(Debug, Clone, Default)]
pub struct ChunkReassembler {
    partials: HashMap<PeerId, PartialPayload>,
}

impl ChunkReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a frame from `from`, returning a complete payload when ready
    ///
    /// Frames without a chunk header are complete payloads already.
    pub fn accept(&mut self, from: &PeerId, frame: &[u8], now: Timestamp) -> Option<Vec<u8>> {
        let Some((index, count)) = parse_chunk_header(frame) else {
            return Some(frame.to_vec());
        };

        let restart = match self.partials.get(from) {
            Some(partial) => partial.parts.len() != count as usize || index == 0,
            None => true,
        };
        if restart {
            self.partials.insert(
                from.clone(),
                PartialPayload {
                    parts: vec![None; count as usize],
                    received: 0,
                    started_at: now,
                },
            );
        }

        let partial = self.partials.get_mut(from)?;
        let slot = partial.parts.get_mut(index as usize)?;
        if slot.is_none() {
            *slot = Some(frame[CHUNK_HEADER_SIZE..].to_vec());
            partial.received += 1;
        }

        if partial.received < partial.parts.len() {
            return None;
        }

        let finished = self.partials.remove(from)?;
        Some(finished.parts.into_iter().flatten().flatten().collect())
    }

    /// Drop partial payloads older than the reassembly timeout
    pub fn evict_stale(&mut self, now: Timestamp) -> usize {
        let before = self.partials.len();
        self.partials
            .retain(|_, partial| !partial.started_at.is_older_than(REASSEMBLY_TIMEOUT, now));
        before - self.partials.len()
    }

    pub fn pending_streams(&self) -> usize {
        self.partials.len()
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
