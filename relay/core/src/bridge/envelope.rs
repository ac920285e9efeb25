//! Bridge Envelope Codec
//!
//! Wire format of the cross-process bridge: length-prefixed JSON envelopes
//! with a CRC32 checksum.
//!
//! # Envelope Format
//!
//! ```text
//! +----------------+----------------+------------------------------------------+
//! | Length (4)     | Checksum (4)   | JSON Payload (variable)                  |
//! | big-endian u32 | CRC32 (BE)     | BridgeEnvelope                           |
//! +----------------+----------------+------------------------------------------+
//! ```
//!
//! Request bodies stay raw JSON until the server parses them, so an unknown
//! request `type` can still be answered (with `UNKNOWN_ERROR`) under its id.

use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::messages::{BridgeRequest, BridgeResponse, StreamBroadcast};
use crate::transport::MAX_FRAME_SIZE;

/// Length + checksum
const HEADER_SIZE: usize = 8;

/// One message on the bridge socket
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BridgeEnvelope {
    /// Client -> server request
    Request {
        /// Correlation id, unique per client connection
        id: u64,
        /// Request body (`BridgeRequest` JSON)
        body: serde_json::Value,
    },
    /// Server -> client response to request `id`
    Response {
        /// Correlation id
        id: u64,
        /// `[errorOrNull, data]`
        body: BridgeResponse,
    },
    /// Server -> every client
    Broadcast {
        /// Forwarded frame
        body: StreamBroadcast,
    },
}

impl BridgeEnvelope {
    /// Wrap a typed request
    pub fn request(id: u64, request: &BridgeRequest) -> Result<Self, TransportError> {
        let body = serde_json::to_value(request)
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        Ok(Self::Request { id, body })
    }
}

/// Encode an envelope: `[len][crc32][json]`
///
/// # Errors
///
/// Returns `TransportError::SerializationError` if serialization fails or
/// the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode(envelope: &BridgeEnvelope) -> Result<Vec<u8>, TransportError> {
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| TransportError::SerializationError(e.to_string()))?;
    if payload.len() > MAX_FRAME_SIZE {
        return Err(TransportError::SerializationError(format!(
            "Envelope too large: {} bytes (max: {MAX_FRAME_SIZE})",
            payload.len()
        )));
    }

    let mut out = Vec::with_capacity(HEADER_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_be_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[..4]);
    u32::from_be_bytes(word)
}

/// Incremental envelope decoder
///
/// Feed raw socket bytes with [`push`](Self::push), then drain complete
/// envelopes with [`decode_next`](Self::decode_next).
#[derive(Debug, Default)]
pub struct EnvelopeDecoder {
    pending: Vec<u8>,
}

impl EnvelopeDecoder {
    /// Create an empty decoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes
    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Bytes buffered but not yet decoded
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Decode the next complete envelope
    ///
    /// `Ok(None)` means more bytes are needed. After an error the stream is
    /// out of sync and the connection should be dropped.
    pub fn decode_next(&mut self) -> Result<Option<BridgeEnvelope>, TransportError> {
        if self.pending.len() < HEADER_SIZE {
            return Ok(None);
        }

        let len = read_u32(&self.pending) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(TransportError::SerializationError(format!(
                "Envelope size {len} exceeds maximum {MAX_FRAME_SIZE}"
            )));
        }
        if self.pending.len() < HEADER_SIZE + len {
            return Ok(None);
        }

        let expected = read_u32(&self.pending[4..]);
        let frame: Vec<u8> = self.pending.drain(..HEADER_SIZE + len).collect();
        let payload = &frame[HEADER_SIZE..];

        let actual = crc32fast::hash(payload);
        if actual != expected {
            return Err(TransportError::ChecksumMismatch { expected, actual });
        }

        serde_json::from_slice(payload)
            .map(Some)
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }
}
