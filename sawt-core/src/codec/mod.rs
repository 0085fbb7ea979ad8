//! Transport-level chunk types and the PCM16 codec.
//!
//! Uplink: `AudioFrame` (f32, 16 kHz) → [`encode`] → `EncodedChunk`.
//! Downlink: `InboundChunk` → [`decode`] → `DecodedBuffer` (f32, 24 kHz).

pub mod pcm;

pub use pcm::{decode, encode};

/// Codec tag attached to every uplink chunk.
pub const INPUT_MIME: &str = "pcm;rate=16000";

/// Codec tag the remote agent uses for its speech.
pub const OUTPUT_MIME: &str = "pcm;rate=24000";

/// Transport-ready representation of one captured frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    /// Little-endian signed 16-bit samples.
    pub data: Vec<u8>,
    pub mime_type: &'static str,
}

impl EncodedChunk {
    pub fn sample_count(&self) -> usize {
        self.data.len() / 2
    }
}

/// Raw inbound payload as the transport delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    Base64(String),
    Raw(Vec<u8>),
}

/// One fragment of remote speech.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChunk {
    pub payload: ChunkPayload,
    pub mime_type: String,
    /// Arrival sequence within the session.
    pub seq: u64,
}

impl InboundChunk {
    pub fn raw(data: Vec<u8>, seq: u64) -> Self {
        Self {
            payload: ChunkPayload::Raw(data),
            mime_type: OUTPUT_MIME.to_string(),
            seq,
        }
    }

    pub fn base64(data: impl Into<String>, mime_type: impl Into<String>, seq: u64) -> Self {
        Self {
            payload: ChunkPayload::Base64(data.into()),
            mime_type: mime_type.into(),
            seq,
        }
    }
}
