//! WebSocket transport to the hosted live voice agent.
//!
//! `connect` returns at once; a tokio task owns the socket. The task sends the
//! setup message, reports `Open` when the service acknowledges it with
//! `setupComplete`, and from then on multiplexes queued uplink chunks with
//! inbound messages until either side closes.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{
    protocol::{InboundMessage, MediaBlob},
    SessionConfig, SessionHandle, Transport, TransportEvent, TransportEventSender,
};
use crate::codec::EncodedChunk;
use crate::error::{BridgeError, Result};

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

#[derive(Debug, Clone)]
pub struct LiveTransport {
    endpoint: String,
    api_key: String,
}

impl LiveTransport {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

enum Outbound {
    Media(EncodedChunk),
    Close,
}

/// How the socket task ended.
enum Ending {
    Local,
    Remote(Option<String>),
}

impl Transport for LiveTransport {
    fn connect(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionHandle>> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| BridgeError::Transport(format!("live transport needs a tokio runtime: {e}")))?;

        let url = format!("{}?key={}", self.endpoint, self.api_key);
        let setup = setup_message(config).to_string();
        let open = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel();

        info!(endpoint = %self.endpoint, model = %config.model, "connecting to live agent");

        let task_open = Arc::clone(&open);
        runtime.spawn(async move {
            let ending = run_socket(url, setup, rx, &events, &task_open).await;
            task_open.store(false, Ordering::Release);
            match ending {
                Ok(Ending::Local) => debug!("live socket closed locally"),
                Ok(Ending::Remote(reason)) => {
                    let _ = events.send(TransportEvent::Closed { reason });
                }
                Err(e) => {
                    let _ = events.send(TransportEvent::Error(e.to_string()));
                }
            }
        });

        Ok(Box::new(LiveSession {
            outbound: Some(tx),
            open,
        }))
    }
}

struct LiveSession {
    /// `None` once closed.
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    open: Arc<AtomicBool>,
}

impl SessionHandle for LiveSession {
    fn send(&mut self, chunk: EncodedChunk) -> Result<()> {
        let Some(tx) = &self.outbound else {
            return Err(BridgeError::NotOpen);
        };
        if !self.open.load(Ordering::Acquire) {
            return Err(BridgeError::NotOpen);
        }
        tx.send(Outbound::Media(chunk))
            .map_err(|_| BridgeError::Transport("live socket task has exited".into()))
    }

    fn close(&mut self) -> Result<()> {
        if let Some(tx) = self.outbound.take() {
            // The task may already be gone after a remote close.
            let _ = tx.send(Outbound::Close);
        }
        Ok(())
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn run_socket(
    url: String,
    setup: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: &TransportEventSender,
    open: &AtomicBool,
) -> Result<Ending> {
    let (ws, _response) = connect_async(url)
        .await
        .map_err(|e| BridgeError::Transport(format!("connect: {e}")))?;
    let (mut sink, mut stream) = ws.split();

    sink.send(Message::Text(setup))
        .await
        .map_err(|e| BridgeError::Transport(format!("send setup: {e}")))?;

    let mut seq = 0u64;
    loop {
        tokio::select! {
            cmd = outbound.recv() => match cmd {
                Some(Outbound::Media(chunk)) => {
                    let text = realtime_input_message(&chunk).to_string();
                    sink.send(Message::Text(text))
                        .await
                        .map_err(|e| BridgeError::Transport(format!("send audio: {e}")))?;
                }
                Some(Outbound::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(Ending::Local);
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if !dispatch(text.as_bytes(), &mut seq, events, open) {
                        return Ok(Ending::Local);
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if !dispatch(&bytes, &mut seq, events, open) {
                        return Ok(Ending::Local);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return Ok(Ending::Remote(frame.map(|f| f.reason.to_string())));
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(BridgeError::Transport(e.to_string())),
                None => return Ok(Ending::Remote(None)),
            },
        }
    }
}

/// Forward one inbound payload. Returns `false` once nobody is listening.
fn dispatch(payload: &[u8], seq: &mut u64, events: &TransportEventSender, open: &AtomicBool) -> bool {
    let message: InboundMessage = match serde_json::from_slice(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!("ignoring unparseable live message: {e}");
            return true;
        }
    };

    if message.is_setup_complete() && !open.swap(true, Ordering::AcqRel) {
        info!("live session ready");
        if events.send(TransportEvent::Open).is_err() {
            return false;
        }
    }

    message
        .into_events(seq)
        .into_iter()
        .all(|event| events.send(event).is_ok())
}

fn setup_message(config: &SessionConfig) -> Value {
    let mut setup = json!({
        "model": config.model,
        "generationConfig": {
            "responseModalities": [config.response_modality],
            "speechConfig": {
                "voiceConfig": {
                    "prebuiltVoiceConfig": { "voiceName": config.voice_name }
                }
            }
        }
    });
    if !config.system_instruction.is_empty() {
        setup["systemInstruction"] = json!({ "parts": [{ "text": config.system_instruction }] });
    }
    json!({ "setup": setup })
}

fn realtime_input_message(chunk: &EncodedChunk) -> Value {
    let mut blob = MediaBlob::from_chunk(chunk);
    blob.mime_type = format!("audio/{}", blob.mime_type);
    json!({ "realtimeInput": { "mediaChunks": [blob] } })
}
