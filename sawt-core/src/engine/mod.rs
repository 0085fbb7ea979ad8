//! `VoiceBridge`: top-level lifecycle controller.
//!
//! ## Lifecycle
//!
//! ```text
//! VoiceBridge::new()              status = connecting
//!     └─► start().await           output + microphone open, connect initiated
//!         └─► TransportEvent::Open        status = connected, frames flow
//!             └─► close() / error         status = closed | error, teardown
//! ```
//!
//! `start()` succeeds at most once per bridge. `close()` is idempotent and may
//! be called from any thread at any point, including while `start()` is still
//! acquiring devices; `start()` then releases what it holds and acquires
//! nothing further.
//!
//! ## Threading
//!
//! Device acquisition runs in `spawn_blocking` because opening a cpal stream
//! blocks on its dedicated thread's handshake. After that a single tokio task
//! (`session::drive`) owns every per-session resource.

pub mod session;
pub mod uplink;

use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc,
};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{info, warn};

use crate::{
    audio::{AudioBackend, CaptureConfig, OutputConfig, ENDED_CHANNEL_CAP},
    error::{BridgeError, Result},
    ipc::events::{InputLevelEvent, SessionStatus, SessionStatusEvent},
    transport::{SessionConfig, Transport},
};

pub use session::{BridgeDiagnostics, DiagnosticsSnapshot, Session};
pub use uplink::DEFAULT_LEVEL_GAIN;

use session::{Command, DriverChannels};

/// Broadcast channel capacity: events buffered for slow subscribers.
const BROADCAST_CAP: usize = 256;

/// Configuration for `VoiceBridge`.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub capture: CaptureConfig,
    pub output: OutputConfig,
    /// Multiplier applied to frame RMS for the input level meter.
    /// Default: 5.0.
    pub level_gain: f32,
    pub session: SessionConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            output: OutputConfig::default(),
            level_gain: DEFAULT_LEVEL_GAIN,
            session: SessionConfig::default(),
        }
    }
}

/// State shared between the bridge handle, the driver task and subscribers.
pub struct SharedState {
    /// Canonical status. Transitions happen under this lock.
    status: Mutex<SessionStatus>,
    muted: AtomicBool,
    /// Latest input level as `f32` bits.
    level: AtomicU32,
    status_tx: broadcast::Sender<SessionStatusEvent>,
    level_tx: broadcast::Sender<InputLevelEvent>,
    diagnostics: BridgeDiagnostics,
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedState {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(BROADCAST_CAP);
        let (level_tx, _) = broadcast::channel(BROADCAST_CAP);
        Self {
            status: Mutex::new(SessionStatus::Connecting),
            muted: AtomicBool::new(false),
            level: AtomicU32::new(0f32.to_bits()),
            status_tx,
            level_tx,
            diagnostics: BridgeDiagnostics::default(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }

    /// Move to `next` if the edge is allowed and broadcast it. Returns whether
    /// the status changed.
    pub fn transition(&self, next: SessionStatus, detail: Option<String>) -> bool {
        let mut status = self.status.lock();
        if !status.can_transition_to(next) {
            return false;
        }
        info!(from = ?*status, to = ?next, "session status");
        *status = next;
        // Sent under the lock so subscribers observe transitions in order.
        let _ = self.status_tx.send(SessionStatusEvent {
            status: next,
            detail,
        });
        true
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Acquire)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Release);
    }

    /// Flip the mute flag, returning the new value.
    pub fn toggle_muted(&self) -> bool {
        !self.muted.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn input_level(&self) -> f32 {
        f32::from_bits(self.level.load(Ordering::Relaxed))
    }

    pub(crate) fn publish_level(&self, event: InputLevelEvent) {
        self.level.store(event.level.to_bits(), Ordering::Relaxed);
        let _ = self.level_tx.send(event);
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.status_tx.subscribe()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<InputLevelEvent> {
        self.level_tx.subscribe()
    }

    pub fn diagnostics(&self) -> &BridgeDiagnostics {
        &self.diagnostics
    }
}

/// The top-level bridge handle.
///
/// `VoiceBridge` is `Send + Sync`; wrap it in an `Arc` to share it between a
/// UI thread and event-forwarding tasks.
pub struct VoiceBridge {
    config: BridgeConfig,
    backend: Arc<dyn AudioBackend>,
    transport: Arc<dyn Transport>,
    shared: Arc<SharedState>,
    started: AtomicBool,
    /// Present once the driver task is running.
    commands: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    finished: Arc<watch::Sender<bool>>,
}

impl VoiceBridge {
    pub fn new(
        config: BridgeConfig,
        backend: impl AudioBackend,
        transport: impl Transport,
    ) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            config,
            backend: Arc::new(backend),
            transport: Arc::new(transport),
            shared: Arc::new(SharedState::new()),
            started: AtomicBool::new(false),
            commands: Mutex::new(None),
            finished: Arc::new(finished),
        }
    }

    /// Acquire the output device, then the microphone, then initiate the
    /// transport connection, and hand everything to the session driver.
    ///
    /// Resolves once the connect is initiated; `connected` is reported later
    /// on the status channel. Any failure sets `error`, releases whatever was
    /// already acquired and is returned.
    ///
    /// # Errors
    /// - `BridgeError::AlreadyStarted` on a second call.
    /// - `BridgeError::SessionClosed` if the bridge was closed before or during start.
    /// - Device and transport errors from acquisition.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(BridgeError::AlreadyStarted);
        }
        if self.shared.status().is_terminal() {
            self.finished.send_replace(true);
            return Err(BridgeError::SessionClosed);
        }

        self.shared.diagnostics().reset();
        info!("starting voice session");

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ended_tx, ended_rx) = mpsc::channel(ENDED_CHANNEL_CAP);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (fault_tx, fault_rx) = mpsc::unbounded_channel();

        let mut session = Session::new(Arc::clone(&self.shared), self.config.level_gain);

        let backend = Arc::clone(&self.backend);
        let output_config = self.config.output.clone();
        let output_faults = fault_tx.clone();
        let output = tokio::task::spawn_blocking(move || {
            backend.open_output(&output_config, ended_tx, output_faults)
        })
            .await
            .map_err(|e| BridgeError::AudioDevice(format!("output open task failed: {e}")))
            .and_then(|r| r);
        match output {
            Ok(o) => session.attach_output(o),
            Err(e) => return Err(self.abort(session, e)),
        }
        if self.shared.status().is_terminal() {
            return Err(self.abandon(session));
        }

        let backend = Arc::clone(&self.backend);
        let capture_config = self.config.capture.clone();
        let capture = tokio::task::spawn_blocking(move || {
            backend.open_capture(&capture_config, frame_tx, fault_tx)
        })
            .await
            .map_err(|e| BridgeError::AudioDevice(format!("capture open task failed: {e}")))
            .and_then(|r| r);
        match capture {
            Ok(c) => session.attach_capture(c),
            Err(e) => return Err(self.abort(session, e)),
        }
        if self.shared.status().is_terminal() {
            return Err(self.abandon(session));
        }

        match self.transport.connect(&self.config.session, event_tx) {
            Ok(handle) => session.attach_transport(handle),
            Err(e) => return Err(self.abort(session, e)),
        }

        *self.commands.lock() = Some(command_tx);
        tokio::spawn(session::drive(
            session,
            DriverChannels {
                commands: command_rx,
                faults: fault_rx,
                events: event_rx,
                ended: ended_rx,
                frames: frame_rx,
            },
            Arc::clone(&self.finished),
        ));
        Ok(())
    }

    /// Close the session. Idempotent; a no-op once `closed` or `error`.
    pub fn close(&self) {
        if self.shared.transition(SessionStatus::Closed, None) {
            info!("session close requested");
        }
        match self.commands.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(Command::Close);
            }
            None if !self.started.load(Ordering::SeqCst) => {
                self.finished.send_replace(true);
            }
            // `start()` is mid-acquisition and will observe the closed status.
            None => {}
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.shared.set_muted(muted);
        info!(muted, "microphone mute changed");
    }

    /// Flip mute, returning the new value.
    pub fn toggle_mute(&self) -> bool {
        let muted = self.shared.toggle_muted();
        info!(muted, "microphone mute changed");
        muted
    }

    pub fn is_muted(&self) -> bool {
        self.shared.is_muted()
    }

    /// Current session status (snapshot).
    pub fn status(&self) -> SessionStatus {
        self.shared.status()
    }

    /// Latest input level in [0, 1].
    pub fn input_level(&self) -> f32 {
        self.shared.input_level()
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<SessionStatusEvent> {
        self.shared.subscribe_status()
    }

    pub fn subscribe_levels(&self) -> broadcast::Receiver<InputLevelEvent> {
        self.shared.subscribe_levels()
    }

    /// Snapshot of session counters for observability.
    pub fn diagnostics_snapshot(&self) -> DiagnosticsSnapshot {
        self.shared.diagnostics().snapshot()
    }

    /// Resolve once the session has ended and every resource is released.
    pub async fn wait(&self) {
        let mut rx = self.finished.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    /// `close()` arrived while `start()` was acquiring: release what the
    /// partial session holds and acquire nothing further.
    fn abandon(&self, mut session: Session) -> BridgeError {
        info!("session closed during start, releasing acquired devices");
        session.close();
        drop(session);
        self.finished.send_replace(true);
        BridgeError::SessionClosed
    }

    /// Fail a partially built session: releases what it holds, marks the
    /// bridge finished and hands back the error.
    fn abort(&self, mut session: Session, error: BridgeError) -> BridgeError {
        if self.shared.status().is_terminal() {
            warn!("session closed during start: {error}");
        }
        session.fail(error.to_string());
        drop(session);
        self.finished.send_replace(true);
        error
    }
}

impl Drop for VoiceBridge {
    fn drop(&mut self) {
        self.close();
    }
}
