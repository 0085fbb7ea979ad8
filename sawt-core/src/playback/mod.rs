//! Downlink playback: gapless scheduling on the output timeline and barge-in
//! flushing.
//!
//! Both types are plain `&mut` state owned by the session driver task. A
//! schedule and an interrupt therefore never interleave.

pub mod interrupt;
pub mod scheduler;

pub use interrupt::InterruptionController;
pub use scheduler::{PlaybackScheduler, ScheduledSource};

use crate::audio::SourceId;
use crate::buffering::chunk::DecodedBuffer;

/// Next free instant on the output device timeline, in seconds.
///
/// Never moved earlier than the device time it was last anchored to.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PlaybackClock {
    next_start: f64,
}

impl PlaybackClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_start(&self) -> f64 {
        self.next_start
    }

    /// Start time for a source scheduled when the device reads `now`.
    pub fn start_for(&self, now: f64) -> f64 {
        self.next_start.max(now)
    }

    pub(crate) fn advance_to(&mut self, t: f64) {
        self.next_start = self.next_start.max(t);
    }

    /// Re-anchor to the device's current time, discarding queued time.
    pub fn reset(&mut self, now: f64) {
        self.next_start = now;
    }
}

/// One started source in the active set.
#[derive(Debug, Clone)]
pub struct PlaybackSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
    pub buffer: DecodedBuffer,
}

impl PlaybackSource {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}
