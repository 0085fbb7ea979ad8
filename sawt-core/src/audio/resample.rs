//! Sample-rate conversion using a rubato `FastFixedIn` resampler.
//!
//! ## Where it runs
//!
//! - Capture worker: devices that refuse a native 16 kHz input config are
//!   opened at their default rate and converted down before framing.
//! - Output: agent speech is 24 kHz. Devices without a 24 kHz config get each
//!   decoded buffer converted by a [`SegmentResampler`], which carries history
//!   across back-to-back sources and returns exactly the frame count the
//!   output timeline reserved for the source.
//! - Echo transport: uplink 16 kHz is converted up to the 24 kHz downlink rate.
//!
//! When both rates are equal `RateConverter` is a passthrough and no rubato
//! session is created at all.
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 1024)?;
//! let out = rc.process(&raw_samples); // streaming, keeps a tail
//! let tail = rc.finish();             // pads and flushes the tail
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{BridgeError, Result};

/// Converts f32 mono audio from one fixed sample rate to another.
pub struct RateConverter {
    /// `None` when both rates match (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Holds input samples until a full `chunk_size` block is available.
    input_buf: Vec<f32>,
    /// Input frame count per rubato call.
    chunk_size: usize,
    /// Pre-allocated output buffer: `[1][output_frames_max]`.
    output_buf: Vec<Vec<f32>>,
    /// Output samples per input sample.
    ratio: f64,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Errors
    /// Returns `BridgeError::AudioDevice` if rubato fails to initialise.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                input_buf: Vec::new(),
                chunk_size,
                output_buf: Vec::new(),
                ratio: 1.0,
            });
        }

        let ratio = to_rate as f64 / from_rate as f64;

        let resampler = FastFixedIn::<f32>::new(
            ratio,
            1.0, // fixed ratio
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| BridgeError::AudioDevice(format!("resampler init: {e}")))?;

        let max_out = resampler.output_frames_max();
        let output_buf = vec![vec![0f32; max_out]; 1];

        debug!(from_rate, to_rate, chunk_size, max_out, "resampler created");

        Ok(Self {
            resampler: Some(resampler),
            input_buf: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            output_buf,
            ratio,
        })
    }

    /// Process incoming samples, returning converted output (may be empty).
    ///
    /// Samples are accumulated until a full `chunk_size` block is available
    /// for rubato; any remainder is kept for the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.input_buf.extend_from_slice(samples);

        let mut result = Vec::new();

        while self.input_buf.len() >= self.chunk_size {
            let input_slice = &self.input_buf[..self.chunk_size];

            match resampler.process_into_buffer(&[input_slice], &mut self.output_buf, None) {
                Ok((_consumed, produced)) => {
                    result.extend_from_slice(&self.output_buf[0][..produced]);
                }
                Err(e) => {
                    error!("resampler process error: {e}");
                }
            }

            self.input_buf.drain(..self.chunk_size);
        }

        result
    }

    /// Flush the buffered tail (zero-padded to one rubato block) and reset.
    pub fn finish(&mut self) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return Vec::new();
        };
        if self.input_buf.is_empty() {
            return Vec::new();
        }

        let tail_len = self.input_buf.len();
        let mut result = Vec::new();
        match resampler.process_partial_into_buffer(
            Some(&[&self.input_buf[..]][..]),
            &mut self.output_buf,
            None,
        ) {
            Ok((_consumed, produced)) => {
                // Only keep the share of output that corresponds to real input.
                let keep = ((tail_len as f64 * self.ratio).ceil() as usize).min(produced);
                result.extend_from_slice(&self.output_buf[0][..keep]);
            }
            Err(e) => error!("resampler flush error: {e}"),
        }
        self.input_buf.clear();
        resampler.reset();
        result
    }

    /// Returns `true` when no conversion occurs.
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

/// Input samples of history carried from one segment into the next.
const SEGMENT_CONTEXT: usize = 8;

/// Edge padding after each segment so the interpolator reaches its last sample.
const SEGMENT_PAD: usize = 16;

/// Converts a run of contiguous buffers so that they join without gaps.
///
/// Each call returns exactly `frames` output samples, aligned so that output
/// sample 0 is input sample 0. The previous segment's tail is used as
/// interpolation history; the first segment of a run (or the first after
/// [`reset`](Self::reset)) uses its own first sample instead, so no segment
/// starts with a filter ramp from silence.
pub struct SegmentResampler {
    ratio: f64,
    context: Vec<f32>,
}

impl SegmentResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        Self {
            ratio: to_rate as f64 / from_rate as f64,
            context: Vec::with_capacity(SEGMENT_CONTEXT),
        }
    }

    /// Forget the history. Call when the next segment does not continue the last one.
    pub fn reset(&mut self) {
        self.context.clear();
    }

    /// Convert `samples` into exactly `frames` output samples.
    pub fn convert(&mut self, samples: &[f32], frames: usize) -> Result<Vec<f32>> {
        let (Some(&first), Some(&last)) = (samples.first(), samples.last()) else {
            self.reset();
            return Ok(vec![0.0; frames]);
        };

        let mut input = Vec::with_capacity(SEGMENT_CONTEXT + samples.len() + SEGMENT_PAD);
        if self.context.len() == SEGMENT_CONTEXT {
            input.extend_from_slice(&self.context);
        } else {
            input.resize(SEGMENT_CONTEXT, first);
        }
        input.extend_from_slice(samples);
        input.resize(input.len() + SEGMENT_PAD, last);

        let mut resampler = FastFixedIn::<f32>::new(
            self.ratio,
            1.0,
            PolynomialDegree::Cubic,
            input.len(),
            1,
        )
        .map_err(|e| BridgeError::AudioDevice(format!("resampler init: {e}")))?;
        // The first interpolated sample lands one step after the reported delay.
        let offset = ((SEGMENT_CONTEXT as f64 * self.ratio).round() as usize
            + resampler.output_delay())
        .saturating_sub(1);
        let converted = resampler
            .process(&[&input[..]], None)
            .map_err(|e| BridgeError::AudioStream(format!("resampler process: {e}")))?;

        let mut segment: Vec<f32> = converted
            .first()
            .and_then(|channel| channel.get(offset..))
            .unwrap_or_default()
            .iter()
            .copied()
            .take(frames)
            .collect();
        if segment.len() < frames {
            debug!(short = frames - segment.len(), "segment padded with its last sample");
            segment.resize(frames, last);
        }

        // Last SEGMENT_CONTEXT samples of history + segment.
        let history_end = SEGMENT_CONTEXT + samples.len();
        self.context.clear();
        self.context
            .extend_from_slice(&input[history_end - SEGMENT_CONTEXT..history_end]);
        Ok(segment)
    }
}

/// Convert one complete buffer in a single call.
pub fn resample_buffer(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    if from_rate == to_rate {
        return Ok(samples.to_vec());
    }
    let mut rc = RateConverter::new(from_rate, to_rate, 1024)?;
    let mut out = rc.process(samples);
    out.extend(rc.finish());
    Ok(out)
}
