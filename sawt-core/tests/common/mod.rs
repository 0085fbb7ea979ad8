//! Mock devices and transport with a manual clock.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::Mutex;
use sawt_core::audio::{
    AudioBackend, AudioOutput, CaptureConfig, CaptureDevice, DeviceFaultSender, FrameSender,
    OutputConfig, SourceEndedSender, SourceId,
};
use sawt_core::buffering::chunk::DecodedBuffer;
use sawt_core::codec::EncodedChunk;
use sawt_core::transport::{SessionConfig, SessionHandle, Transport, TransportEventSender};
use sawt_core::BridgeError;

/// Ordered record of release calls across all mocks.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Device time in seconds, shared with the test.
#[derive(Clone, Default)]
pub struct ManualClock(Arc<AtomicU64>);

impl ManualClock {
    pub fn set(&self, secs: f64) {
        self.0.store(secs.to_bits(), Ordering::SeqCst);
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::SeqCst))
    }
}

#[derive(Default)]
pub struct OutputProbe {
    pub started: Vec<(SourceId, f64, usize)>,
    pub stopped: Vec<SourceId>,
    pub closes: usize,
}

pub struct MockOutput {
    pub clock: ManualClock,
    pub probe: Arc<Mutex<OutputProbe>>,
    pub log: CallLog,
    playing: BTreeMap<SourceId, f64>,
    pub fail_close: bool,
}

impl MockOutput {
    pub fn new(clock: ManualClock, log: CallLog) -> Self {
        Self {
            clock,
            probe: Arc::default(),
            log,
            playing: BTreeMap::new(),
            fail_close: false,
        }
    }
}

impl AudioOutput for MockOutput {
    fn current_time(&self) -> f64 {
        self.clock.now()
    }

    fn start_source(&mut self, id: SourceId, buffer: &DecodedBuffer, start_time: f64) -> sawt_core::error::Result<()> {
        self.playing.insert(id, start_time);
        self.probe.lock().started.push((id, start_time, buffer.len()));
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) -> sawt_core::error::Result<()> {
        self.log.lock().push(format!("output.stop {id}"));
        if self.playing.remove(&id).is_none() {
            return Err(BridgeError::AudioStream(format!("{id} already ended")));
        }
        self.probe.lock().stopped.push(id);
        Ok(())
    }

    fn close(&mut self) -> sawt_core::error::Result<()> {
        self.log.lock().push("output.close".into());
        self.probe.lock().closes += 1;
        if self.fail_close {
            return Err(BridgeError::AudioDevice("device vanished".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct CaptureProbe {
    pub stops: usize,
    pub closes: usize,
}

pub struct MockCapture {
    pub probe: Arc<Mutex<CaptureProbe>>,
    pub log: CallLog,
    pub fail_close: bool,
}

impl MockCapture {
    pub fn new(log: CallLog) -> Self {
        Self {
            probe: Arc::default(),
            log,
            fail_close: false,
        }
    }
}

impl CaptureDevice for MockCapture {
    fn stop(&mut self) {
        self.log.lock().push("capture.stop".into());
        self.probe.lock().stops += 1;
    }

    fn close(&mut self) -> sawt_core::error::Result<()> {
        self.log.lock().push("capture.close".into());
        self.probe.lock().closes += 1;
        if self.fail_close {
            return Err(BridgeError::AudioDevice("permission revoked".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TransportProbe {
    pub connects: usize,
    pub config: Option<SessionConfig>,
    pub sent: Vec<EncodedChunk>,
    pub closes: usize,
    /// Inject inbound events from the test.
    pub events: Option<TransportEventSender>,
}

pub struct MockHandle {
    pub probe: Arc<Mutex<TransportProbe>>,
    pub log: CallLog,
    pub fail_close: bool,
}

impl MockHandle {
    pub fn new(log: CallLog) -> Self {
        Self {
            probe: Arc::default(),
            log,
            fail_close: false,
        }
    }
}

impl SessionHandle for MockHandle {
    fn send(&mut self, chunk: EncodedChunk) -> sawt_core::error::Result<()> {
        self.probe.lock().sent.push(chunk);
        Ok(())
    }

    fn close(&mut self) -> sawt_core::error::Result<()> {
        self.log.lock().push("transport.close".into());
        self.probe.lock().closes += 1;
        if self.fail_close {
            return Err(BridgeError::Transport("socket already gone".into()));
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct MockTransport {
    pub probe: Arc<Mutex<TransportProbe>>,
    pub log: CallLog,
    pub fail_connect: bool,
}

impl MockTransport {
    pub fn new(log: CallLog) -> Self {
        Self {
            probe: Arc::default(),
            log,
            fail_connect: false,
        }
    }

    /// Event sender handed to `connect`.
    pub fn events(&self) -> TransportEventSender {
        self.probe
            .lock()
            .events
            .clone()
            .expect("transport was never connected")
    }
}

impl Transport for MockTransport {
    fn connect(
        &self,
        config: &SessionConfig,
        events: TransportEventSender,
    ) -> sawt_core::error::Result<Box<dyn SessionHandle>> {
        if self.fail_connect {
            return Err(BridgeError::Transport("handshake refused".into()));
        }
        let mut probe = self.probe.lock();
        probe.connects += 1;
        probe.config = Some(config.clone());
        probe.events = Some(events);
        Ok(Box::new(MockHandle {
            probe: Arc::clone(&self.probe),
            log: Arc::clone(&self.log),
            fail_close: false,
        }))
    }
}

/// Runs inside `open_output`, on the blocking pool.
pub type OpenHook = Box<dyn FnOnce() + Send>;

/// Backend that hands out mocks and keeps the device-side channel ends.
#[derive(Clone)]
pub struct MockBackend {
    pub clock: ManualClock,
    pub log: CallLog,
    pub output: Arc<Mutex<OutputProbe>>,
    pub capture: Arc<Mutex<CaptureProbe>>,
    pub frames: Arc<Mutex<Option<FrameSender>>>,
    pub ended: Arc<Mutex<Option<SourceEndedSender>>>,
    pub faults: Arc<Mutex<Option<DeviceFaultSender>>>,
    pub on_output_open: Arc<Mutex<Option<OpenHook>>>,
    pub fail_capture: bool,
}

impl MockBackend {
    pub fn new(log: CallLog) -> Self {
        Self {
            clock: ManualClock::default(),
            log,
            output: Arc::default(),
            capture: Arc::default(),
            frames: Arc::default(),
            ended: Arc::default(),
            faults: Arc::default(),
            on_output_open: Arc::default(),
            fail_capture: false,
        }
    }

    pub fn frames(&self) -> FrameSender {
        self.frames.lock().clone().expect("capture was never opened")
    }

    /// The microphone stops delivering: its frame channel closes.
    pub fn end_capture_stream(&self) {
        self.frames.lock().take().expect("capture was never opened");
    }

    pub fn faults(&self) -> DeviceFaultSender {
        self.faults.lock().clone().expect("no device was opened")
    }
}

impl AudioBackend for MockBackend {
    fn open_capture(
        &self,
        _config: &CaptureConfig,
        frames: FrameSender,
        faults: DeviceFaultSender,
    ) -> sawt_core::error::Result<Box<dyn CaptureDevice>> {
        if self.fail_capture {
            return Err(BridgeError::NoDefaultInputDevice);
        }
        *self.frames.lock() = Some(frames);
        *self.faults.lock() = Some(faults);
        Ok(Box::new(MockCapture {
            probe: Arc::clone(&self.capture),
            log: Arc::clone(&self.log),
            fail_close: false,
        }))
    }

    fn open_output(
        &self,
        _config: &OutputConfig,
        ended: SourceEndedSender,
        faults: DeviceFaultSender,
    ) -> sawt_core::error::Result<Box<dyn AudioOutput>> {
        *self.ended.lock() = Some(ended);
        *self.faults.lock() = Some(faults);
        if let Some(hook) = self.on_output_open.lock().take() {
            hook();
        }
        let mut output = MockOutput::new(self.clock.clone(), Arc::clone(&self.log));
        output.probe = Arc::clone(&self.output);
        Ok(Box::new(output))
    }
}

/// `ms` of 24 kHz PCM16 at a constant level, as raw inbound bytes.
pub fn pcm24k_ms(ms: usize, value: i16) -> Vec<u8> {
    let samples = 24 * ms;
    value
        .to_le_bytes()
        .iter()
        .copied()
        .cycle()
        .take(samples * 2)
        .collect()
}
