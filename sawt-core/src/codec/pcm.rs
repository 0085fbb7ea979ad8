//! Signed 16-bit little-endian PCM conversion.
//!
//! Encoding multiplies by 32768 and truncates toward zero. The float→int cast
//! saturates, so a full-scale `1.0` lands on `i16::MAX` instead of wrapping.
//! No resampling happens here: the uplink is already 16 kHz and the downlink
//! is fixed at 24 kHz by the remote codec.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use super::{ChunkPayload, EncodedChunk, InboundChunk, INPUT_MIME};
use crate::audio::OUTPUT_SAMPLE_RATE;
use crate::buffering::chunk::{AudioFrame, DecodedBuffer};
use crate::error::DecodeError;

const SCALE: f32 = 32768.0;

/// Convert one captured frame into an uplink chunk.
pub fn encode(frame: &AudioFrame) -> EncodedChunk {
    let mut data = Vec::with_capacity(frame.samples.len() * 2);
    for &sample in &frame.samples {
        let q = (sample.clamp(-1.0, 1.0) * SCALE) as i16;
        data.extend_from_slice(&q.to_le_bytes());
    }
    EncodedChunk {
        data,
        mime_type: INPUT_MIME,
    }
}

/// Convert one inbound chunk into playable samples.
///
/// # Errors
/// `DecodeError` for empty, truncated or non-base64 payloads. Callers drop
/// the chunk and keep streaming.
pub fn decode(chunk: &InboundChunk) -> Result<DecodedBuffer, DecodeError> {
    let decoded;
    let bytes: &[u8] = match &chunk.payload {
        ChunkPayload::Raw(bytes) => bytes,
        ChunkPayload::Base64(text) => {
            decoded = STANDARD
                .decode(text.trim())
                .map_err(|e| DecodeError::Base64(e.to_string()))?;
            &decoded
        }
    };

    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() % 2 != 0 {
        return Err(DecodeError::Truncated { len: bytes.len() });
    }

    let samples = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / SCALE)
        .collect::<Vec<_>>();

    Ok(DecodedBuffer::new(samples, OUTPUT_SAMPLE_RATE))
}
