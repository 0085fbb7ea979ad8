//! Microphone capture via cpal.
//!
//! # Design constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It **must not** allocate, block on a mutex or perform I/O. It only
//! down-mixes to mono and writes into an SPSC ring buffer producer whose
//! `push_slice` is lock-free.
//!
//! A `sawt-capture` worker thread owns the stream, drains the ring, converts
//! to 16 kHz when the device could not be opened natively at that rate, cuts
//! fixed frames and hands them to the session over a channel.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig,
};
use tracing::{debug, error, info, warn};

use super::{
    device::{select_device, DeviceDirection},
    resample::RateConverter,
    CaptureConfig, CaptureDevice, DeviceFault, DeviceFaultSender, FrameSender,
};
use crate::{
    buffering::{create_audio_ring, framer::FrameAssembler, AudioConsumer, AudioProducer, Consumer, Producer},
    error::{BridgeError, Result},
};

/// Samples drained from the ring per worker iteration.
const DRAIN_CHUNK: usize = 1024;

/// Worker sleep when the ring is empty.
const EMPTY_SLEEP_MS: u64 = 5;

/// Scratch capacity for the down-mix buffer, sized so common driver block
/// sizes never reallocate inside the callback.
const MIX_SCRATCH: usize = 8192;

/// Handle to a live microphone. Owns the capture worker thread.
pub struct CpalCapture {
    /// Gate shared with the callback and the worker.
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    pub device_name: String,
    /// Rate the device was actually opened at (Hz).
    pub device_rate: u32,
}

struct OpenedStream {
    _stream: Stream,
    device_name: String,
    sample_rate: u32,
}

impl CpalCapture {
    /// Open the preferred (or default) microphone and start delivering frames.
    ///
    /// Blocks until the device is confirmed open or has failed.
    ///
    /// # Errors
    /// `BridgeError::NoDefaultInputDevice` when no microphone exists, or
    /// `BridgeError::AudioStream` when the stream cannot be built (including
    /// permission denial).
    pub fn open(config: CaptureConfig, frames: FrameSender, faults: DeviceFaultSender) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let worker_running = Arc::clone(&running);
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<(String, u32)>>(1);

        let worker = thread::Builder::new()
            .name("sawt-capture".into())
            .spawn(move || {
                let (producer, consumer) = create_audio_ring();
                let opened = match open_stream(&config, producer, Arc::clone(&worker_running), faults) {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = open_tx.send(Ok((opened.device_name.clone(), opened.sample_rate)));

                run_worker(consumer, opened.sample_rate, &config, &worker_running, &frames);

                // Stream drops here, releasing the device on its creation thread.
                drop(opened);
                debug!("capture worker exited");
            })
            .map_err(|e| BridgeError::AudioDevice(format!("spawn capture thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok((device_name, device_rate))) => {
                info!(device = %device_name, device_rate, "microphone open");
                Ok(Self {
                    running,
                    worker: Some(worker),
                    device_name,
                    device_rate,
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(BridgeError::AudioDevice(
                    "capture thread died while opening the device".into(),
                ))
            }
        }
    }
}

impl CaptureDevice for CpalCapture {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
    }

    fn close(&mut self) -> Result<()> {
        self.stop();
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker
            .join()
            .map_err(|_| BridgeError::AudioDevice("capture worker panicked".into()))
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Prefer a native mono config at the target rate, then any channel count at
/// the target rate, then the device default (resampled by the worker).
fn choose_config(device: &cpal::Device, rate: u32) -> Result<SupportedStreamConfig> {
    let native = device.supported_input_configs().ok().and_then(|configs| {
        let mut candidates = configs
            .filter(|c| c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate)
            .filter(|c| {
                matches!(
                    c.sample_format(),
                    SampleFormat::F32 | SampleFormat::I16 | SampleFormat::U8
                )
            })
            .collect::<Vec<_>>();
        candidates.sort_by_key(|c| (c.channels() != 1, c.sample_format() != SampleFormat::F32));
        candidates
            .into_iter()
            .next()
            .map(|c| c.with_sample_rate(SampleRate(rate)))
    });

    match native {
        Some(config) => Ok(config),
        None => {
            warn!(rate, "device has no native config at the uplink rate, resampling");
            device
                .default_input_config()
                .map_err(|e| BridgeError::AudioDevice(e.to_string()))
        }
    }
}

fn open_stream(
    config: &CaptureConfig,
    mut producer: AudioProducer,
    running: Arc<AtomicBool>,
    faults: DeviceFaultSender,
) -> Result<OpenedStream> {
    let device = select_device(DeviceDirection::Input, config.preferred_device.as_deref())?;
    let device_name = device.name().unwrap_or_default();

    let supported = choose_config(&device, config.sample_rate)?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    info!(device = %device_name, sample_rate, channels, "input config selected");

    let stream_config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let ch = channels as usize;
    let mut mix_buf: Vec<f32> = Vec::with_capacity(MIX_SCRATCH);
    let on_error = on_stream_error(Arc::clone(&running), faults);

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_input_stream(
            &stream_config,
            move |data: &[f32], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                if ch == 1 {
                    push_or_warn(&mut producer, data);
                    return;
                }
                downmix(data, ch, &mut mix_buf, |s| s);
                push_or_warn(&mut producer, &mix_buf);
            },
            on_error,
            None,
        ),

        SampleFormat::I16 => device.build_input_stream(
            &stream_config,
            move |data: &[i16], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                downmix(data, ch, &mut mix_buf, |s| s as f32 / 32768.0);
                push_or_warn(&mut producer, &mix_buf);
            },
            on_error,
            None,
        ),

        SampleFormat::U8 => device.build_input_stream(
            &stream_config,
            move |data: &[u8], _info| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                downmix(data, ch, &mut mix_buf, |s| (s as f32 - 128.0) / 128.0);
                push_or_warn(&mut producer, &mix_buf);
            },
            on_error,
            None,
        ),

        fmt => {
            return Err(BridgeError::AudioStream(format!(
                "unsupported sample format: {fmt:?}"
            )))
        }
    }
    .map_err(|e| BridgeError::AudioStream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| BridgeError::AudioStream(e.to_string()))?;

    Ok(OpenedStream {
        _stream: stream,
        device_name,
        sample_rate,
    })
}

/// A vanished device ends capture: the worker exits, which closes the frame
/// channel, and the session is told why. Other backend errors are logged.
fn on_stream_error(
    running: Arc<AtomicBool>,
    faults: DeviceFaultSender,
) -> impl FnMut(cpal::StreamError) + Send + 'static {
    move |err| match err {
        cpal::StreamError::DeviceNotAvailable => {
            error!("input device lost: {err}");
            running.store(false, Ordering::Release);
            let _ = faults.send(DeviceFault::Input(err.to_string()));
        }
        other => error!("input stream error: {other}"),
    }
}

/// Average interleaved channels into `out`, converting each sample with `to_f32`.
fn downmix<T: Copy>(data: &[T], ch: usize, out: &mut Vec<f32>, to_f32: impl Fn(T) -> f32) {
    let frames = data.len() / ch;
    out.clear();
    for f in 0..frames {
        let base = f * ch;
        let mut sum = 0f32;
        for c in 0..ch {
            sum += to_f32(data[base + c]);
        }
        out.push(sum / ch as f32);
    }
}

fn push_or_warn(producer: &mut AudioProducer, samples: &[f32]) {
    let written = producer.push_slice(samples);
    if written < samples.len() {
        warn!("capture ring full: dropped {} samples", samples.len() - written);
    }
}

/// Drain → convert → frame → send, until stopped or the session goes away.
fn run_worker(
    mut consumer: AudioConsumer,
    device_rate: u32,
    config: &CaptureConfig,
    running: &AtomicBool,
    frames: &FrameSender,
) {
    let mut converter = match RateConverter::new(device_rate, config.sample_rate, DRAIN_CHUNK) {
        Ok(c) => c,
        Err(e) => {
            error!("failed to create capture resampler: {e}");
            return;
        }
    };
    let mut framer = FrameAssembler::new(config.frame_size, config.sample_rate);
    let mut raw = vec![0f32; DRAIN_CHUNK];

    while running.load(Ordering::Acquire) {
        let n = consumer.pop_slice(&mut raw);
        if n == 0 {
            thread::sleep(Duration::from_millis(EMPTY_SLEEP_MS));
            continue;
        }

        let converted = converter.process(&raw[..n]);
        let mut receiver_gone = false;
        framer.push(&converted, |frame| {
            if frames.send(frame).is_err() {
                receiver_gone = true;
            }
        });
        if receiver_gone {
            debug!("frame receiver dropped, stopping capture worker");
            break;
        }
    }

    // Partial frames are never delivered.
    framer.clear();
}
