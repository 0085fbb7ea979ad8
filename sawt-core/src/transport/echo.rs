//! Loopback transport.
//!
//! Opens instantly and answers every uplink chunk with the same audio,
//! converted from the 16 kHz uplink rate to the 24 kHz downlink rate. Used by
//! the host when no credentials are configured and by the end-to-end tests.

use tracing::{debug, trace};

use super::{SessionConfig, SessionHandle, Transport, TransportEvent, TransportEventSender};
use crate::audio::{resample::resample_buffer, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE};
use crate::codec::{EncodedChunk, InboundChunk};
use crate::error::{BridgeError, Result};

#[derive(Debug, Default, Clone, Copy)]
pub struct EchoTransport;

impl Transport for EchoTransport {
    fn connect(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> Result<Box<dyn SessionHandle>> {
        debug!(model = %config.model, "echo transport connecting");
        events
            .send(TransportEvent::Open)
            .map_err(|_| BridgeError::Transport("event receiver dropped".into()))?;
        Ok(Box::new(EchoSession {
            events,
            seq: 0,
            open: true,
        }))
    }
}

struct EchoSession {
    events: TransportEventSender,
    seq: u64,
    open: bool,
}

impl SessionHandle for EchoSession {
    fn send(&mut self, chunk: EncodedChunk) -> Result<()> {
        if !self.open {
            return Err(BridgeError::NotOpen);
        }

        let uplink = chunk
            .data
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
            .collect::<Vec<_>>();
        let downlink = resample_buffer(&uplink, INPUT_SAMPLE_RATE, OUTPUT_SAMPLE_RATE)?;

        let mut data = Vec::with_capacity(downlink.len() * 2);
        for s in downlink {
            data.extend_from_slice(&((s.clamp(-1.0, 1.0) * 32768.0) as i16).to_le_bytes());
        }

        trace!(seq = self.seq, bytes = data.len(), "echoing chunk");
        let event = TransportEvent::Audio(InboundChunk::raw(data, self.seq));
        self.seq += 1;
        self.events
            .send(event)
            .map_err(|_| BridgeError::Transport("event receiver dropped".into()))
    }

    fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            debug!(echoed = self.seq, "echo transport closed");
        }
        Ok(())
    }
}
