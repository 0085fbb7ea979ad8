//! JSON payloads exchanged with the remote agent.
//!
//! ## Shapes
//!
//! ```text
//! out:  { "media": { "data": <base64>, "mimeType": "pcm;rate=16000" } }
//! in:   { "content": { "turn": { "parts": [ { "inlineAudio": { "data", "mimeType" } } ] } } }
//! in:   { "content": { "interrupted": true } }
//! ```
//!
//! The live service spells the inbound fields `serverContent`, `modelTurn` and
//! `inlineData`; both spellings deserialize into the same types.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::TransportEvent;
use crate::codec::{EncodedChunk, InboundChunk};

/// Base64 payload plus its codec tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaBlob {
    pub data: String,
    pub mime_type: String,
}

impl MediaBlob {
    pub fn from_chunk(chunk: &EncodedChunk) -> Self {
        Self {
            data: STANDARD.encode(&chunk.data),
            mime_type: chunk.mime_type.to_string(),
        }
    }
}

/// Uplink message carrying one encoded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub media: MediaBlob,
}

impl From<&EncodedChunk> for OutboundMessage {
    fn from(chunk: &EncodedChunk) -> Self {
        Self {
            media: MediaBlob::from_chunk(chunk),
        }
    }
}

/// Any downlink message. Unknown fields are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(default, alias = "serverContent", skip_serializing_if = "Option::is_none")]
    pub content: Option<ServerContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_complete: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default, alias = "modelTurn", skip_serializing_if = "Option::is_none")]
    pub turn: Option<Turn>,
    #[serde(default)]
    pub interrupted: bool,
    #[serde(default)]
    pub turn_complete: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default, alias = "inlineData", skip_serializing_if = "Option::is_none")]
    pub inline_audio: Option<MediaBlob>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl InboundMessage {
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn interrupt() -> Self {
        Self {
            content: Some(ServerContent {
                interrupted: true,
                ..ServerContent::default()
            }),
            setup_complete: None,
        }
    }

    pub fn audio(blob: MediaBlob) -> Self {
        Self {
            content: Some(ServerContent {
                turn: Some(Turn {
                    parts: vec![Part {
                        inline_audio: Some(blob),
                        text: None,
                    }],
                }),
                ..ServerContent::default()
            }),
            setup_complete: None,
        }
    }

    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Flatten into session events: every audio part in order, then the
    /// interrupt, then turn completion. `next_seq` numbers the audio chunks.
    pub fn into_events(self, next_seq: &mut u64) -> Vec<TransportEvent> {
        let Some(content) = self.content else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(turn) = content.turn {
            for blob in turn.parts.into_iter().filter_map(|p| p.inline_audio) {
                events.push(TransportEvent::Audio(InboundChunk::base64(
                    blob.data,
                    blob.mime_type,
                    *next_seq,
                )));
                *next_seq += 1;
            }
        }
        if content.interrupted {
            events.push(TransportEvent::Interrupted);
        }
        if content.turn_complete {
            events.push(TransportEvent::TurnComplete);
        }
        events
    }
}
