//! Audio device boundary.
//!
//! The bridge never touches cpal directly. It talks to three traits:
//!
//! - [`AudioBackend`] opens devices (the only acquisition point),
//! - [`CaptureDevice`] is a live microphone delivering [`AudioFrame`]s,
//! - [`AudioOutput`] is an output timeline that plays sources at absolute times.
//!
//! The cpal implementations live in [`input`] and [`output`]; tests supply
//! their own implementations with a manual clock.
//!
//! # Threading note
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS). Each cpal stream is therefore created and dropped on a dedicated
//! thread; the handles returned here only hold channels and join handles.

pub mod device;
#[cfg(feature = "audio-cpal")]
pub mod input;
#[cfg(feature = "audio-cpal")]
pub mod output;
pub mod resample;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::buffering::chunk::{AudioFrame, DecodedBuffer};
use crate::error::Result;

/// Uplink sample rate (Hz). The transport requires 16 kHz mono PCM.
pub const INPUT_SAMPLE_RATE: u32 = 16_000;

/// Downlink sample rate (Hz) dictated by the remote agent's codec.
pub const OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Samples per captured frame (≈ 256 ms at 16 kHz).
pub const FRAME_SIZE: usize = 4096;

/// Capacity of the source-ended channel fed from the output callback.
pub const ENDED_CHANNEL_CAP: usize = 256;

/// Captured frames, in capture order, from the capture worker to the session.
pub type FrameSender = mpsc::UnboundedSender<AudioFrame>;
pub type FrameReceiver = mpsc::UnboundedReceiver<AudioFrame>;

/// Natural-completion notifications from the output device.
///
/// Bounded so the real-time callback can `try_send` without allocating.
pub type SourceEndedSender = mpsc::Sender<SourceId>;
pub type SourceEndedReceiver = mpsc::Receiver<SourceId>;

/// A device that stopped working while the session was running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFault {
    Input(String),
    Output(String),
}

impl std::fmt::Display for DeviceFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Input(detail) => write!(f, "microphone failed: {detail}"),
            Self::Output(detail) => write!(f, "speaker failed: {detail}"),
        }
    }
}

/// Fatal device errors, reported from cpal's error callbacks (not the
/// real-time data callbacks).
pub type DeviceFaultSender = mpsc::UnboundedSender<DeviceFault>;
pub type DeviceFaultReceiver = mpsc::UnboundedReceiver<DeviceFault>;

/// Identifies one scheduled playback source for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(pub u64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "src-{}", self.0)
    }
}

/// Input device parameters.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Rate of the frames delivered to the session (Hz).
    pub sample_rate: u32,
    /// Samples per delivered frame.
    pub frame_size: usize,
    /// Device name to prefer over the system default.
    pub preferred_device: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: INPUT_SAMPLE_RATE,
            frame_size: FRAME_SIZE,
            preferred_device: None,
        }
    }
}

/// Output device parameters.
#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Rate the device timeline is opened at, when the device supports it.
    pub sample_rate: u32,
    pub preferred_device: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            sample_rate: OUTPUT_SAMPLE_RATE,
            preferred_device: None,
        }
    }
}

/// A live microphone.
pub trait CaptureDevice: Send {
    /// Stop delivering frames: mute the device callback (the "tracks") and
    /// detach the framing worker (the processing graph). Idempotent.
    fn stop(&mut self);

    /// Release the input device. Idempotent; calling it on an already closed
    /// device is not an error.
    fn close(&mut self) -> Result<()>;
}

/// An output timeline that plays buffers at absolute device times.
pub trait AudioOutput: Send {
    /// Current device time in seconds. Monotonic while the device is open.
    fn current_time(&self) -> f64;

    /// Start `buffer` at device time `start_time` (seconds).
    ///
    /// When the source finishes on its own the device reports `id` on the
    /// source-ended channel it was opened with.
    fn start_source(&mut self, id: SourceId, buffer: &DecodedBuffer, start_time: f64) -> Result<()>;

    /// Stop a source immediately. Stopping a source that already finished is
    /// allowed to fail; callers ignore the error.
    fn stop_source(&mut self, id: SourceId) -> Result<()>;

    /// Release the output device. Idempotent.
    fn close(&mut self) -> Result<()>;
}

/// Opens devices. Held by the session lifecycle manager only.
///
/// A device that dies after opening reports on `faults`; the session treats
/// that as fatal.
pub trait AudioBackend: Send + Sync + 'static {
    fn open_capture(
        &self,
        config: &CaptureConfig,
        frames: FrameSender,
        faults: DeviceFaultSender,
    ) -> Result<Box<dyn CaptureDevice>>;

    fn open_output(
        &self,
        config: &OutputConfig,
        ended: SourceEndedSender,
        faults: DeviceFaultSender,
    ) -> Result<Box<dyn AudioOutput>>;
}

impl<T: AudioBackend + ?Sized> AudioBackend for Arc<T> {
    fn open_capture(
        &self,
        config: &CaptureConfig,
        frames: FrameSender,
        faults: DeviceFaultSender,
    ) -> Result<Box<dyn CaptureDevice>> {
        (**self).open_capture(config, frames, faults)
    }

    fn open_output(
        &self,
        config: &OutputConfig,
        ended: SourceEndedSender,
        faults: DeviceFaultSender,
    ) -> Result<Box<dyn AudioOutput>> {
        (**self).open_output(config, ended, faults)
    }
}

/// System devices through cpal.
#[cfg(feature = "audio-cpal")]
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

#[cfg(feature = "audio-cpal")]
impl AudioBackend for CpalBackend {
    fn open_capture(
        &self,
        config: &CaptureConfig,
        frames: FrameSender,
        faults: DeviceFaultSender,
    ) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(input::CpalCapture::open(config.clone(), frames, faults)?))
    }

    fn open_output(
        &self,
        config: &OutputConfig,
        ended: SourceEndedSender,
        faults: DeviceFaultSender,
    ) -> Result<Box<dyn AudioOutput>> {
        Ok(Box::new(output::CpalOutput::open(config.clone(), ended, faults)?))
    }
}
