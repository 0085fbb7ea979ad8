//! # sawt-core
//!
//! Real-time duplex voice bridge to a remote conversational speech agent.
//!
//! ## Architecture
//!
//! ```text
//! Microphone → CpalCapture → SPSC RingBuffer → capture worker (resample, 4096-sample frames)
//!                                                    │
//!                                   session driver ◄─┘   (one tokio task)
//!                                     │   ▲
//!                 Uplink: level, mute, │   │ TransportEvent: Open, Audio, Interrupted, …
//!                 PCM16 encode         ▼   │
//!                                  SessionHandle / Transport
//!                                         │
//!               decode → PlaybackScheduler (max(clock, now)) → CpalOutput mixer → Speaker
//!                            ▲
//!                 InterruptionController (stop all, clock = now)
//! ```
//!
//! Device callbacks are zero-alloc. All session state is owned by the driver
//! task, so scheduling and interruption never race.

#![forbid(unsafe_code)]
#![warn(clippy::all)]

pub mod audio;
pub mod buffering;
pub mod codec;
pub mod engine;
pub mod error;
pub mod ipc;
pub mod playback;
pub mod transport;

// Convenience re-exports for downstream crates
pub use audio::{AudioBackend, AudioOutput, CaptureDevice};
pub use engine::{BridgeConfig, DiagnosticsSnapshot, VoiceBridge};
pub use error::{BridgeError, DecodeError};
pub use ipc::events::{InputLevelEvent, SessionStatus, SessionStatusEvent};
pub use transport::{EchoTransport, SessionConfig, SessionHandle, Transport, TransportEvent};

#[cfg(feature = "audio-cpal")]
pub use audio::CpalBackend;

#[cfg(feature = "live")]
pub use transport::LiveTransport;
