use thiserror::Error;

/// All errors produced by sawt-core.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no default input device found")]
    NoDefaultInputDevice,

    #[error("no default output device found")]
    NoDefaultOutputDevice,

    #[error("output device is closed")]
    OutputClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("transport is not open")]
    NotOpen,

    #[error("session already started")]
    AlreadyStarted,

    #[error("session is closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// Recoverable failure decoding one inbound chunk. The chunk is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("chunk payload is empty")]
    Empty,

    #[error("truncated pcm payload: {len} bytes is not a whole number of samples")]
    Truncated { len: usize },

    #[error("invalid base64 payload: {0}")]
    Base64(String),
}
