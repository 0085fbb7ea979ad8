//! Per-frame uplink logic: level metering, mute gate, encoding.

use crate::buffering::chunk::AudioFrame;
use crate::codec::{self, EncodedChunk};
use crate::ipc::events::InputLevelEvent;

/// Default multiplier applied to the frame RMS before clamping.
pub const DEFAULT_LEVEL_GAIN: f32 = 5.0;

/// Display level for one block: `rms × gain`, clamped to [0, 1].
pub fn input_level(samples: &[f32], gain: f32) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_sq / samples.len() as f32).sqrt();
    (rms * gain).clamp(0.0, 1.0)
}

/// What the uplink produced for one captured frame.
#[derive(Debug)]
pub struct UplinkFrame {
    pub level: InputLevelEvent,
    /// `None` while muted.
    pub chunk: Option<EncodedChunk>,
}

#[derive(Debug)]
pub struct Uplink {
    gain: f32,
    seq: u64,
}

impl Uplink {
    pub fn new(gain: f32) -> Self {
        Self { gain, seq: 0 }
    }

    /// Meter the frame and, unless muted, encode it for the transport.
    ///
    /// The level is produced either way so the host meter keeps moving while
    /// the microphone is muted.
    pub fn process(&mut self, frame: &AudioFrame, muted: bool) -> UplinkFrame {
        let level = InputLevelEvent {
            seq: self.seq,
            level: input_level(&frame.samples, self.gain),
            muted,
        };
        self.seq += 1;

        let chunk = (!muted).then(|| codec::encode(frame));
        UplinkFrame { level, chunk }
    }
}
