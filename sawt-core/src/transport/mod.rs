//! Session transport boundary.
//!
//! The remote voice agent is an external duplex channel. The bridge depends on
//! two traits only:
//!
//! - [`Transport`] starts a connection and returns a [`SessionHandle`]
//!   immediately; readiness and failures arrive later as [`TransportEvent`]s,
//! - [`SessionHandle`] accepts outbound chunks and closes the channel.
//!
//! Every inbound callback (`onopen`, `onmessage`, `onerror`, `onclose`) is a
//! variant on one ordered channel, so the session handles them strictly in
//! arrival order.

pub mod echo;
#[cfg(feature = "live")]
pub mod live;
pub mod protocol;

pub use echo::EchoTransport;
#[cfg(feature = "live")]
pub use live::LiveTransport;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::codec::{EncodedChunk, InboundChunk};
use crate::error::Result;

/// Default live model identifier.
pub const DEFAULT_MODEL: &str = "models/gemini-2.5-flash-native-audio-preview-09-2025";

/// Default prebuilt voice.
pub const DEFAULT_VOICE: &str = "Fenrir";

/// What the remote agent should answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Modality {
    Audio,
    Text,
}

/// Connection configuration supplied at connect time.
///
/// `system_instruction` is opaque to the bridge; the host owns the persona.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub model: String,
    pub response_modality: Modality,
    pub voice_name: String,
    pub system_instruction: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            response_modality: Modality::Audio,
            voice_name: DEFAULT_VOICE.to_string(),
            system_instruction: String::new(),
        }
    }
}

/// Everything the transport can tell the session, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Channel ready; `send` may be called from now on.
    Open,
    /// One fragment of agent speech.
    Audio(InboundChunk),
    /// The agent's queued and playing output must be discarded now.
    Interrupted,
    /// The agent finished a response turn.
    TurnComplete,
    /// Connect or channel failure.
    Error(String),
    /// The remote side closed the channel.
    Closed { reason: Option<String> },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;
pub type TransportEventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Starts connections to the remote agent.
pub trait Transport: Send + Sync + 'static {
    /// Begin connecting. Must not block; the outcome is reported as
    /// `TransportEvent::Open` or `TransportEvent::Error` on `events`.
    fn connect(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionHandle>>;
}

/// One live connection.
pub trait SessionHandle: Send {
    /// Queue one chunk for delivery. Fire-and-forget.
    ///
    /// # Errors
    /// `BridgeError::NotOpen` before the channel reported `Open` or after close.
    fn send(&mut self, chunk: EncodedChunk) -> Result<()>;

    /// Release the remote session. Idempotent.
    fn close(&mut self) -> Result<()>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn connect(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionHandle>> {
        (**self).connect(config, events)
    }
}
