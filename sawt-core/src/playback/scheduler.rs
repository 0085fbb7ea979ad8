//! Gapless playback scheduling.
//!
//! Every decoded buffer starts at `max(clock, device_now)` and pushes the
//! clock to its own end, so consecutive buffers abut exactly while the
//! remote side keeps up. When it falls behind within one agent turn, the next
//! buffer starts "now" and the gap is reported as an underrun.
//!
//! The active set does not depend on the device delivering every completion
//! notice: sources whose end time has passed are reclaimed before each
//! schedule and interrupt.

use std::collections::BTreeMap;

use tracing::{debug, trace};

use super::{PlaybackClock, PlaybackSource};
use crate::audio::{AudioOutput, SourceId};
use crate::buffering::chunk::DecodedBuffer;
use crate::error::Result;

/// Where a buffer landed on the output timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledSource {
    pub id: SourceId,
    pub start_time: f64,
    pub duration: f64,
    /// Silence inserted before this source because the clock had fallen
    /// behind the device (seconds, 0 when gapless).
    pub underrun: f64,
}

#[derive(Debug, Default)]
pub struct PlaybackScheduler {
    clock: PlaybackClock,
    active: BTreeMap<SourceId, PlaybackSource>,
    next_id: u64,
    /// True while consecutive buffers belong to one agent turn.
    streaming: bool,
    /// Sources reclaimed by time since the last `take_reclaimed`.
    reclaimed: usize,
}

impl PlaybackScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Anchor an idle clock to the device's present.
    pub fn anchor(&mut self, now: f64) {
        if self.active.is_empty() {
            self.clock.reset(now);
        }
    }

    /// Start `buffer` on `output` right after everything already queued.
    ///
    /// # Errors
    /// Propagates the device error from `start_source`; clock and active set
    /// are left untouched in that case.
    pub fn schedule(
        &mut self,
        output: &mut dyn AudioOutput,
        buffer: DecodedBuffer,
    ) -> Result<ScheduledSource> {
        let now = output.current_time();
        self.prune_finished(now);
        let start_time = self.clock.start_for(now);
        let underrun = if self.streaming {
            (now - self.clock.next_start()).max(0.0)
        } else {
            0.0
        };

        let id = SourceId(self.next_id);
        output.start_source(id, &buffer, start_time)?;
        self.next_id += 1;

        let duration = buffer.duration_secs();
        self.clock.advance_to(start_time + duration);
        self.streaming = true;
        trace!(%id, start_time, duration, "source scheduled");

        self.active.insert(
            id,
            PlaybackSource {
                id,
                start_time,
                duration,
                buffer,
            },
        );

        Ok(ScheduledSource {
            id,
            start_time,
            duration,
            underrun,
        })
    }

    /// Natural completion reported by the device. Returns whether `id` was
    /// still active (it is not after an interrupt already stopped it).
    pub fn complete(&mut self, id: SourceId) -> bool {
        self.active.remove(&id).is_some()
    }

    /// Drop sources that finished by device time `now`, whether or not their
    /// completion notice arrived. Returns how many were dropped.
    pub fn prune_finished(&mut self, now: f64) -> usize {
        let before = self.active.len();
        self.active.retain(|_, source| source.end_time() > now);
        let pruned = before - self.active.len();
        if pruned > 0 {
            trace!(pruned, now, "finished sources reclaimed");
            self.reclaimed += pruned;
        }
        pruned
    }

    /// Sources reclaimed by [`prune_finished`](Self::prune_finished) since the last call.
    pub fn take_reclaimed(&mut self) -> usize {
        std::mem::take(&mut self.reclaimed)
    }

    /// The agent finished its turn; the next buffer opens a new stream.
    pub fn end_turn(&mut self) {
        self.streaming = false;
    }

    /// Stop every active source, ignoring per-source stop failures, and empty
    /// the set. Returns how many sources were active.
    pub fn stop_all(&mut self, output: &mut dyn AudioOutput) -> usize {
        let count = self.active.len();
        for id in std::mem::take(&mut self.active).into_keys() {
            if let Err(e) = output.stop_source(id) {
                debug!(%id, "stop ignored: {e}");
            }
        }
        self.streaming = false;
        count
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn active(&self) -> impl Iterator<Item = &PlaybackSource> {
        self.active.values()
    }

    pub fn clock(&self) -> PlaybackClock {
        self.clock
    }

    pub(crate) fn clock_mut(&mut self) -> &mut PlaybackClock {
        &mut self.clock
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::audio::OUTPUT_SAMPLE_RATE;
    use crate::playback::testing::ManualOutput;

    fn buffer_ms(ms: usize) -> DecodedBuffer {
        DecodedBuffer::new(vec![0.1; OUTPUT_SAMPLE_RATE as usize * ms / 1000], OUTPUT_SAMPLE_RATE)
    }

    #[test]
    fn back_to_back_buffers_abut() {
        let mut out = ManualOutput {
            now: 1.0,
            ..ManualOutput::default()
        };
        let mut scheduler = PlaybackScheduler::new();

        let first = scheduler.schedule(&mut out, buffer_ms(100)).expect("first");
        let second = scheduler.schedule(&mut out, buffer_ms(100)).expect("second");

        assert_relative_eq!(first.start_time, 1.0);
        assert_relative_eq!(second.start_time, first.start_time + 0.1, epsilon = 1e-9);
        assert_relative_eq!(scheduler.clock().next_start(), 1.2, epsilon = 1e-9);
        assert_eq!(scheduler.active_len(), 2);
        assert_eq!(second.underrun, 0.0);
    }

    #[test]
    fn starts_are_monotonic_and_never_overlap() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        let mut prev_end = f64::NEG_INFINITY;

        for (i, ms) in [40, 120, 10, 300, 80].into_iter().enumerate() {
            out.now = i as f64 * 0.05;
            let s = scheduler.schedule(&mut out, buffer_ms(ms)).expect("schedule");
            assert!(s.start_time >= out.now);
            assert!(s.start_time >= prev_end - 1e-12);
            prev_end = s.start_time + s.duration;
        }
    }

    #[test]
    fn late_buffer_starts_now_and_reports_underrun() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(&mut out, buffer_ms(100)).expect("first");

        out.now = 0.25;
        let late = scheduler.schedule(&mut out, buffer_ms(100)).expect("late");
        assert_relative_eq!(late.start_time, 0.25);
        assert_relative_eq!(late.underrun, 0.15, epsilon = 1e-9);
    }

    #[test]
    fn late_buffer_in_a_new_turn_is_not_an_underrun() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(&mut out, buffer_ms(100)).expect("first");
        scheduler.end_turn();

        out.now = 0.25;
        let next = scheduler.schedule(&mut out, buffer_ms(100)).expect("next");
        assert_relative_eq!(next.start_time, 0.25);
        assert_eq!(next.underrun, 0.0);
    }

    #[test]
    fn finished_sources_are_reclaimed_without_a_notice() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&mut out, buffer_ms(100)).expect("a");
        let b = scheduler.schedule(&mut out, buffer_ms(100)).expect("b");

        // `a` ended at 0.1 but its notice was lost; `b` is still playing.
        out.now = 0.15;
        assert_eq!(scheduler.prune_finished(out.now), 1);
        assert_eq!(scheduler.active().map(|s| s.id).collect::<Vec<_>>(), vec![b.id]);
        assert!(!scheduler.complete(a.id));

        out.now = 0.5;
        scheduler.schedule(&mut out, buffer_ms(20)).expect("c");
        assert_eq!(scheduler.active_len(), 1);
        assert_eq!(scheduler.take_reclaimed(), 2);
        assert_eq!(scheduler.take_reclaimed(), 0);
    }

    #[test]
    fn anchor_moves_an_idle_clock_to_device_time() {
        let mut scheduler = PlaybackScheduler::new();
        scheduler.anchor(12.5);
        assert_relative_eq!(scheduler.clock().next_start(), 12.5);

        let mut out = ManualOutput {
            now: 12.5,
            ..ManualOutput::default()
        };
        scheduler.schedule(&mut out, buffer_ms(100)).expect("schedule");
        scheduler.anchor(13.0);
        assert_relative_eq!(scheduler.clock().next_start(), 12.6, epsilon = 1e-9);
    }

    #[test]
    fn device_failure_leaves_state_untouched() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        scheduler.schedule(&mut out, buffer_ms(100)).expect("first");
        let clock = scheduler.clock();

        out.fail_next_start = true;
        assert!(scheduler.schedule(&mut out, buffer_ms(100)).is_err());
        assert_eq!(scheduler.clock(), clock);
        assert_eq!(scheduler.active_len(), 1);
    }

    #[test]
    fn completion_removes_from_active_set() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        let s = scheduler.schedule(&mut out, buffer_ms(20)).expect("schedule");

        assert!(scheduler.complete(s.id));
        assert!(!scheduler.complete(s.id));
        assert_eq!(scheduler.active_len(), 0);
    }

    #[test]
    fn stop_all_ignores_sources_that_already_ended() {
        let mut out = ManualOutput::default();
        let mut scheduler = PlaybackScheduler::new();
        let a = scheduler.schedule(&mut out, buffer_ms(20)).expect("a");
        scheduler.schedule(&mut out, buffer_ms(20)).expect("b");

        // Device finished `a` but the ended event has not been processed yet.
        out.playing.remove(&a.id);

        assert_eq!(scheduler.stop_all(&mut out), 2);
        assert_eq!(scheduler.active_len(), 0);
        assert!(out.playing.is_empty());
    }
}
