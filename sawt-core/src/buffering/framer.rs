//! Cuts an arbitrary stream of mono samples into fixed-size frames.
//!
//! Device callbacks deliver whatever block size the driver picked; the uplink
//! contract is exactly `frame_size` samples per frame. A tail shorter than one
//! frame is held until more samples arrive and is dropped on `clear`.

use super::chunk::AudioFrame;

#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    sample_rate: u32,
    pending: Vec<f32>,
}

impl FrameAssembler {
    pub fn new(frame_size: usize, sample_rate: u32) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            sample_rate,
            pending: Vec::with_capacity(frame_size),
        }
    }

    /// Append samples and invoke `emit` once per completed frame, in order.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(AudioFrame)) {
        while !samples.is_empty() {
            let room = self.frame_size - self.pending.len();
            let take = room.min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];

            if self.pending.len() == self.frame_size {
                let full = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
                emit(AudioFrame::new(full, self.sample_rate));
            }
        }
    }

    /// Samples waiting for the next frame boundary.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Drop the partial tail.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
