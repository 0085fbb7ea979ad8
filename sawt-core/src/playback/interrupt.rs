//! Barge-in handling.
//!
//! When the remote agent reports that the user spoke over it, everything it
//! had queued is stale. The controller stops every active source and pulls
//! the clock back to the device's present so the next reply starts at once.

use tracing::info;

use super::PlaybackScheduler;
use crate::audio::AudioOutput;

#[derive(Debug, Default)]
pub struct InterruptionController {
    interrupts: u64,
}

impl InterruptionController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flush queued and playing speech. Returns the number of sources stopped.
    ///
    /// A no-op when nothing is active. Sources that already finished on the
    /// device are reclaimed first and are not counted as stopped.
    pub fn interrupt(&mut self, scheduler: &mut PlaybackScheduler, output: &mut dyn AudioOutput) -> usize {
        let now = output.current_time();
        scheduler.prune_finished(now);
        if scheduler.active_len() == 0 {
            return 0;
        }

        let stopped = scheduler.stop_all(output);
        scheduler.clock_mut().reset(now);
        self.interrupts += 1;

        info!(stopped, now, "playback interrupted");
        stopped
    }

    /// Interrupts that actually flushed something.
    pub fn count(&self) -> u64 {
        self.interrupts
    }
}
