//! Typed sample blocks moving through the bridge.

use std::sync::Arc;

/// One fixed-size block of captured mono microphone samples.
///
/// Produced by the capture worker, consumed immediately by the uplink.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Mono f32 samples in [-1.0, 1.0].
    pub samples: Vec<f32>,
    /// Sample rate in Hz (16 000 on the uplink).
    pub sample_rate: u32,
    /// Channel count. Always 1 once framed.
    pub channels: u16,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Returns the duration of this frame in seconds.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Decoded agent speech, ready to be scheduled on the output timeline.
///
/// Samples sit behind an `Arc` so the scheduler's active set and the output
/// mixer can share one allocation.
#[derive(Debug, Clone)]
pub struct DecodedBuffer {
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples: samples.into(),
            sample_rate,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Playback duration in seconds at the buffer's own sample rate.
    pub fn duration_secs(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}
