//! The session driver: one task that owns every per-session resource.
//!
//! ```text
//! commands ──┐
//! faults ────┤
//! transport ─┤  select! (biased, in this order)  ──► Session (&mut)
//! ended ─────┤                                        ├─ Uplink → SessionHandle::send
//! frames ────┘                                        ├─ decode → PlaybackScheduler
//!                                                     └─ InterruptionController
//! ```
//!
//! Because the scheduler, clock and interruption controller are only reached
//! through `&mut Session`, an interrupt always completes before the next
//! inbound chunk is scheduled.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use super::{uplink::Uplink, SharedState};
use crate::audio::{
    AudioOutput, CaptureDevice, DeviceFaultReceiver, FrameReceiver, SourceEndedReceiver, SourceId,
};
use crate::buffering::chunk::AudioFrame;
use crate::codec;
use crate::error::BridgeError;
use crate::ipc::events::SessionStatus;
use crate::playback::{InterruptionController, PlaybackClock, PlaybackScheduler};
use crate::transport::{SessionHandle, TransportEvent, TransportEventReceiver};

/// Counters updated by the session driver.
#[derive(Debug, Default)]
pub struct BridgeDiagnostics {
    pub frames_captured: AtomicUsize,
    pub frames_muted: AtomicUsize,
    pub frames_dropped: AtomicUsize,
    pub chunks_sent: AtomicUsize,
    pub send_errors: AtomicUsize,
    pub chunks_received: AtomicUsize,
    pub decode_errors: AtomicUsize,
    pub sources_scheduled: AtomicUsize,
    pub schedule_errors: AtomicUsize,
    pub underruns: AtomicUsize,
    pub sources_completed: AtomicUsize,
    pub interrupts: AtomicUsize,
    pub sources_interrupted: AtomicUsize,
}

impl BridgeDiagnostics {
    pub fn reset(&self) {
        for counter in self.counters() {
            counter.store(0, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        DiagnosticsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            frames_muted: self.frames_muted.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            chunks_sent: self.chunks_sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            chunks_received: self.chunks_received.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            sources_scheduled: self.sources_scheduled.load(Ordering::Relaxed),
            schedule_errors: self.schedule_errors.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            sources_completed: self.sources_completed.load(Ordering::Relaxed),
            interrupts: self.interrupts.load(Ordering::Relaxed),
            sources_interrupted: self.sources_interrupted.load(Ordering::Relaxed),
        }
    }

    fn counters(&self) -> [&AtomicUsize; 13] {
        [
            &self.frames_captured,
            &self.frames_muted,
            &self.frames_dropped,
            &self.chunks_sent,
            &self.send_errors,
            &self.chunks_received,
            &self.decode_errors,
            &self.sources_scheduled,
            &self.schedule_errors,
            &self.underruns,
            &self.sources_completed,
            &self.interrupts,
            &self.sources_interrupted,
        ]
    }
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiagnosticsSnapshot {
    /// Frames received from capture while connected.
    pub frames_captured: usize,
    pub frames_muted: usize,
    /// Frames discarded because the session was not connected.
    pub frames_dropped: usize,
    pub chunks_sent: usize,
    pub send_errors: usize,
    pub chunks_received: usize,
    pub decode_errors: usize,
    pub sources_scheduled: usize,
    pub schedule_errors: usize,
    pub underruns: usize,
    pub sources_completed: usize,
    pub interrupts: usize,
    pub sources_interrupted: usize,
}

/// Control messages from `VoiceBridge` to the driver.
#[derive(Debug)]
pub(crate) enum Command {
    Close,
}

/// All mutable state of one voice session.
///
/// Resources are attached as the lifecycle manager acquires them and released
/// in a fixed order by [`Session::close`], [`Session::fail`] or `Drop`.
pub struct Session {
    shared: Arc<SharedState>,
    uplink: Uplink,
    capture: Option<Box<dyn CaptureDevice>>,
    output: Option<Box<dyn AudioOutput>>,
    transport: Option<Box<dyn SessionHandle>>,
    scheduler: PlaybackScheduler,
    interrupter: InterruptionController,
}

impl Session {
    pub fn new(shared: Arc<SharedState>, level_gain: f32) -> Self {
        Self {
            shared,
            uplink: Uplink::new(level_gain),
            capture: None,
            output: None,
            transport: None,
            scheduler: PlaybackScheduler::new(),
            interrupter: InterruptionController::new(),
        }
    }

    /// Attach the speaker and anchor the playback clock to its current time.
    pub fn attach_output(&mut self, output: Box<dyn AudioOutput>) {
        self.scheduler.anchor(output.current_time());
        self.output = Some(output);
    }

    pub fn attach_capture(&mut self, capture: Box<dyn CaptureDevice>) {
        self.capture = Some(capture);
    }

    pub fn attach_transport(&mut self, transport: Box<dyn SessionHandle>) {
        self.transport = Some(transport);
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.status().is_terminal()
    }

    pub fn active_sources(&self) -> usize {
        self.scheduler.active_len()
    }

    pub fn playback_clock(&self) -> PlaybackClock {
        self.scheduler.clock()
    }

    /// Uplink path for one captured frame.
    pub fn handle_frame(&mut self, frame: AudioFrame) {
        let diag = self.shared.diagnostics();
        if self.shared.status() != SessionStatus::Connected {
            bump(&diag.frames_dropped);
            return;
        }
        bump(&diag.frames_captured);

        let out = self.uplink.process(&frame, self.shared.is_muted());
        self.shared.publish_level(out.level);

        let Some(chunk) = out.chunk else {
            bump(&diag.frames_muted);
            return;
        };
        let Some(transport) = self.transport.as_mut() else {
            bump(&diag.frames_dropped);
            return;
        };
        match transport.send(chunk) {
            Ok(()) => bump(&diag.chunks_sent),
            Err(e) => {
                bump(&diag.send_errors);
                warn!("uplink send failed: {e}");
            }
        }
    }

    /// Downlink and control path, in transport arrival order.
    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        if self.is_finished() {
            trace!(?event, "event after session end ignored");
            return;
        }

        match event {
            TransportEvent::Open => {
                if self.shared.transition(SessionStatus::Connected, None) {
                    info!("session connected");
                }
            }
            TransportEvent::Audio(chunk) => self.play(chunk),
            TransportEvent::Interrupted => self.interrupt(),
            TransportEvent::TurnComplete => {
                self.scheduler.end_turn();
                debug!("agent turn complete");
            }
            TransportEvent::Error(detail) => self.fail(detail),
            TransportEvent::Closed { reason } => {
                let detail = match reason {
                    Some(r) if !r.is_empty() => format!("connection closed by remote: {r}"),
                    _ => "connection closed by remote".to_string(),
                };
                self.fail(detail);
            }
        }
    }

    /// Natural completion reported by the output device.
    pub fn handle_source_ended(&mut self, id: SourceId) {
        if self.scheduler.complete(id) {
            bump(&self.shared.diagnostics().sources_completed);
            trace!(%id, "source finished");
        }
    }

    /// Enter `error` with `detail` and release everything.
    pub fn fail(&mut self, detail: String) {
        if self.shared.transition(SessionStatus::Error, Some(detail.clone())) {
            warn!("session failed: {detail}");
        }
        self.release();
    }

    /// Enter `closed` and release everything. Idempotent.
    pub fn close(&mut self) {
        if self.shared.transition(SessionStatus::Closed, None) {
            info!("session closed");
        }
        self.release();
    }

    fn play(&mut self, chunk: codec::InboundChunk) {
        let shared = Arc::clone(&self.shared);
        let diag = shared.diagnostics();
        bump(&diag.chunks_received);

        let buffer = match codec::decode(&chunk) {
            Ok(b) => b,
            Err(e) => {
                bump(&diag.decode_errors);
                warn!(seq = chunk.seq, "dropping inbound chunk: {e}");
                return;
            }
        };

        let Some(output) = self.output.as_deref_mut() else {
            bump(&diag.schedule_errors);
            warn!(seq = chunk.seq, "no output device, dropping chunk");
            return;
        };

        let scheduled = self.scheduler.schedule(output, buffer);
        self.count_reclaimed();
        match scheduled {
            Ok(s) => {
                bump(&diag.sources_scheduled);
                if s.underrun > 0.0 {
                    bump(&diag.underruns);
                    debug!(id = %s.id, gap = s.underrun, "playback underrun");
                }
                trace!(seq = chunk.seq, id = %s.id, start = s.start_time, "chunk scheduled");
            }
            Err(e) => {
                bump(&diag.schedule_errors);
                warn!(seq = chunk.seq, "failed to start playback source: {e}");
            }
        }
    }

    fn interrupt(&mut self) {
        let Some(output) = self.output.as_deref_mut() else {
            return;
        };
        let stopped = self.interrupter.interrupt(&mut self.scheduler, output);
        self.count_reclaimed();
        if stopped > 0 {
            let diag = self.shared.diagnostics();
            bump(&diag.interrupts);
            diag.sources_interrupted.fetch_add(stopped, Ordering::Relaxed);
        }
    }

    /// Sources the scheduler dropped by time count as completed.
    fn count_reclaimed(&mut self) {
        let reclaimed = self.scheduler.take_reclaimed();
        if reclaimed > 0 {
            self.shared
                .diagnostics()
                .sources_completed
                .fetch_add(reclaimed, Ordering::Relaxed);
        }
    }

    /// Release order: transport, capture, playback sources, output device.
    /// Each step runs even when an earlier one failed.
    fn release(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close() {
                warn!("transport close failed: {e}");
            }
        }

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
            if let Err(e) = capture.close() {
                warn!("input device close failed: {e}");
            }
        }

        if let Some(mut output) = self.output.take() {
            let stopped = self.scheduler.stop_all(output.as_mut());
            if stopped > 0 {
                debug!(stopped, "stopped playback sources");
            }
            if let Err(e) = output.close() {
                warn!("output device close failed: {e}");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Channels the driver multiplexes.
pub(crate) struct DriverChannels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub faults: DeviceFaultReceiver,
    pub events: TransportEventReceiver,
    pub ended: SourceEndedReceiver,
    pub frames: FrameReceiver,
}

/// Run `session` until it reaches a terminal state, then release it and
/// signal `finished`.
pub(crate) async fn drive(mut session: Session, mut ch: DriverChannels, finished: Arc<watch::Sender<bool>>) {
    debug!("session driver started");

    while !session.is_finished() {
        tokio::select! {
            biased;

            cmd = ch.commands.recv() => match cmd {
                Some(Command::Close) | None => session.close(),
            },

            Some(fault) = ch.faults.recv() => session.fail(fault.to_string()),

            event = ch.events.recv() => match event {
                Some(event) => session.handle_transport_event(event),
                None => session.fail(BridgeError::Transport("event channel closed".into()).to_string()),
            },

            Some(id) = ch.ended.recv() => session.handle_source_ended(id),

            frame = ch.frames.recv() => match frame {
                Some(frame) => session.handle_frame(frame),
                None => session.fail("microphone stream ended".into()),
            },
        }
    }

    drop(session);
    finished.send_replace(true);
    debug!("session driver exited");
}
