//! Speaker output via cpal, with a sample-accurate playback timeline.
//!
//! The device clock is the number of frames the output callback has rendered;
//! `current_time()` is that count divided by the device rate. Sources are
//! placed at absolute frame offsets, so a source scheduled for `t` starts at
//! frame `round(t × rate)` regardless of callback block size.
//!
//! Each source occupies exactly the frames between `round(start × rate)` and
//! `round(end × rate)`, so a source scheduled at the previous one's end time
//! abuts it with no gap and no overlap. When the device does not run at the
//! downlink rate, an [`OutputTimeline`] converts contiguous sources as one
//! continuous run.
//!
//! The callback takes the mixer with `try_lock`. On contention it renders
//! silence but still advances the clock, so the timeline never stalls.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use cpal::{
    traits::{DeviceTrait, StreamTrait},
    SampleFormat, SampleRate, Stream, StreamConfig, SupportedStreamConfig,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    device::{select_device, DeviceDirection},
    resample::SegmentResampler,
    AudioOutput, DeviceFault, DeviceFaultSender, OutputConfig, SourceEndedSender, SourceId,
};
use crate::{
    buffering::chunk::DecodedBuffer,
    error::{BridgeError, Result},
};

struct Voice {
    id: SourceId,
    start_frame: u64,
    samples: Arc<[f32]>,
}

impl Voice {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }
}

/// Which sources sound at which absolute output frame.
#[derive(Default)]
pub struct OutputMixer {
    voices: Vec<Voice>,
}

impl OutputMixer {
    pub fn add(&mut self, id: SourceId, start_frame: u64, samples: Arc<[f32]>) {
        self.voices.push(Voice {
            id,
            start_frame,
            samples,
        });
    }

    /// Remove a source. Returns `false` if it already finished or was never added.
    pub fn remove(&mut self, id: SourceId) -> bool {
        let before = self.voices.len();
        self.voices.retain(|v| v.id != id);
        self.voices.len() != before
    }

    pub fn clear(&mut self) {
        self.voices.clear();
    }

    pub fn len(&self) -> usize {
        self.voices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voices.is_empty()
    }

    /// Render interleaved frames `[position, position + out.len() / channels)`.
    ///
    /// Mono sources are copied to every channel. Sources whose last frame
    /// falls inside the block are removed and reported through `on_ended`.
    pub fn render(
        &mut self,
        out: &mut [f32],
        channels: usize,
        position: u64,
        mut on_ended: impl FnMut(SourceId),
    ) {
        out.fill(0.0);
        let channels = channels.max(1);
        let frames = (out.len() / channels) as u64;
        let end = position + frames;

        for voice in &self.voices {
            let from = voice.start_frame.max(position);
            let to = voice.end_frame().min(end);
            if from >= to {
                continue;
            }
            for frame in from..to {
                let sample = voice.samples[(frame - voice.start_frame) as usize];
                let base = (frame - position) as usize * channels;
                for slot in &mut out[base..base + channels] {
                    *slot += sample;
                }
            }
        }

        self.voices.retain(|v| {
            let finished = v.end_frame() <= end;
            if finished {
                on_ended(v.id);
            }
            !finished
        });

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }
}

/// Places decoded buffers on the device's frame timeline.
pub struct OutputTimeline {
    device_rate: u32,
    resampler: Option<(u32, SegmentResampler)>,
    /// End frame of the last placed source, while its run is unbroken.
    run_end: Option<u64>,
}

impl OutputTimeline {
    pub fn new(device_rate: u32) -> Self {
        Self {
            device_rate,
            resampler: None,
            run_end: None,
        }
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    fn frame_at(&self, t: f64) -> u64 {
        (t.max(0.0) * self.device_rate as f64).round() as u64
    }

    /// Start frame and device-rate samples for `buffer` starting at `start_time`.
    pub fn place(&mut self, buffer: &DecodedBuffer, start_time: f64) -> Result<(u64, Arc<[f32]>)> {
        let start_frame = self.frame_at(start_time);
        if buffer.sample_rate == self.device_rate {
            self.run_end = Some(start_frame + buffer.len() as u64);
            return Ok((start_frame, Arc::clone(&buffer.samples)));
        }

        let end_frame = self.frame_at(start_time + buffer.duration_secs()).max(start_frame);
        let frames = (end_frame - start_frame) as usize;

        let resampler = match &mut self.resampler {
            Some((rate, r)) if *rate == buffer.sample_rate => r,
            slot => {
                let (_, r) = slot.insert((
                    buffer.sample_rate,
                    SegmentResampler::new(buffer.sample_rate, self.device_rate),
                ));
                r
            }
        };
        if self.run_end != Some(start_frame) {
            resampler.reset();
        }
        let samples = resampler.convert(&buffer.samples, frames)?;
        self.run_end = Some(end_frame);
        Ok((start_frame, samples.into()))
    }

    /// The next source will not continue the last one.
    pub fn break_run(&mut self) {
        self.run_end = None;
    }
}

struct OutputShared {
    /// Frames rendered since the stream started.
    position: AtomicU64,
    mixer: Mutex<OutputMixer>,
}

/// Handle to an open speaker. Owns the `sawt-output` thread that owns the stream.
pub struct CpalOutput {
    shared: Arc<OutputShared>,
    timeline: OutputTimeline,
    shutdown: Option<crossbeam_channel::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    pub device_name: String,
}

impl CpalOutput {
    /// Open the preferred (or default) output device, preferring `config.sample_rate`.
    ///
    /// Blocks until the stream is playing or has failed.
    pub fn open(
        config: OutputConfig,
        ended: SourceEndedSender,
        faults: DeviceFaultSender,
    ) -> Result<Self> {
        let shared = Arc::new(OutputShared {
            position: AtomicU64::new(0),
            mixer: Mutex::new(OutputMixer::default()),
        });
        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<(String, u32)>>(1);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);

        let thread_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("sawt-output".into())
            .spawn(move || {
                let (stream, name, rate) = match open_stream(&config, thread_shared, ended, faults) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = open_tx.send(Err(e));
                        return;
                    }
                };
                let _ = open_tx.send(Ok((name, rate)));

                // Park until close() or the handle is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                debug!("output stream released");
            })
            .map_err(|e| BridgeError::AudioDevice(format!("spawn output thread: {e}")))?;

        match open_rx.recv() {
            Ok(Ok((device_name, device_rate))) => {
                info!(device = %device_name, device_rate, "speaker open");
                Ok(Self {
                    shared,
                    timeline: OutputTimeline::new(device_rate),
                    shutdown: Some(shutdown_tx),
                    worker: Some(worker),
                    device_name,
                })
            }
            Ok(Err(e)) => {
                let _ = worker.join();
                Err(e)
            }
            Err(_) => {
                let _ = worker.join();
                Err(BridgeError::AudioDevice(
                    "output thread died while opening the device".into(),
                ))
            }
        }
    }

    fn is_closed(&self) -> bool {
        self.worker.is_none()
    }
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.shared.position.load(Ordering::Acquire) as f64 / self.timeline.device_rate() as f64
    }

    fn start_source(&mut self, id: SourceId, buffer: &DecodedBuffer, start_time: f64) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::OutputClosed);
        }
        let (start_frame, samples) = self.timeline.place(buffer, start_time)?;
        self.shared.mixer.lock().add(id, start_frame, samples);
        Ok(())
    }

    fn stop_source(&mut self, id: SourceId) -> Result<()> {
        self.timeline.break_run();
        if self.shared.mixer.lock().remove(id) {
            Ok(())
        } else {
            Err(BridgeError::AudioStream(format!("{id} is not playing")))
        }
    }

    fn close(&mut self) -> Result<()> {
        self.shared.mixer.lock().clear();
        drop(self.shutdown.take());
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        worker
            .join()
            .map_err(|_| BridgeError::AudioDevice("output thread panicked".into()))
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn choose_config(device: &cpal::Device, rate: u32) -> Result<SupportedStreamConfig> {
    let native = device.supported_output_configs().ok().and_then(|configs| {
        let mut candidates = configs
            .filter(|c| c.min_sample_rate().0 <= rate && c.max_sample_rate().0 >= rate)
            .filter(|c| matches!(c.sample_format(), SampleFormat::F32 | SampleFormat::I16))
            .collect::<Vec<_>>();
        candidates.sort_by_key(|c| (c.sample_format() != SampleFormat::F32, c.channels()));
        candidates
            .into_iter()
            .next()
            .map(|c| c.with_sample_rate(SampleRate(rate)))
    });

    match native {
        Some(config) => Ok(config),
        None => {
            warn!(rate, "device has no native config at the downlink rate, resampling");
            device
                .default_output_config()
                .map_err(|e| BridgeError::AudioDevice(e.to_string()))
        }
    }
}

fn open_stream(
    config: &OutputConfig,
    shared: Arc<OutputShared>,
    ended: SourceEndedSender,
    faults: DeviceFaultSender,
) -> Result<(Stream, String, u32)> {
    let device = select_device(DeviceDirection::Output, config.preferred_device.as_deref())?;
    let device_name = device.name().unwrap_or_default();

    let supported = choose_config(&device, config.sample_rate)?;
    let sample_rate = supported.sample_rate().0;
    let channels = supported.channels();

    info!(device = %device_name, sample_rate, channels, "output config selected");

    let stream_config = StreamConfig {
        channels,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let ch = channels as usize;
    let on_error = move |err: cpal::StreamError| match err {
        cpal::StreamError::DeviceNotAvailable => {
            error!("output device lost: {err}");
            let _ = faults.send(DeviceFault::Output(err.to_string()));
        }
        other => error!("output stream error: {other}"),
    };

    let stream = match supported.sample_format() {
        SampleFormat::F32 => device.build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                render_block(&shared, data, ch, &ended);
            },
            on_error,
            None,
        ),

        SampleFormat::I16 => {
            let mut scratch: Vec<f32> = Vec::with_capacity(16_384);
            device.build_output_stream(
                &stream_config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    scratch.resize(data.len(), 0.0);
                    render_block(&shared, &mut scratch, ch, &ended);
                    for (dst, src) in data.iter_mut().zip(scratch.iter()) {
                        *dst = (*src * i16::MAX as f32) as i16;
                    }
                },
                on_error,
                None,
            )
        }

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

    Ok((stream, device_name, sample_rate))
}

/// Real-time path: never blocks, never allocates.
fn render_block(shared: &OutputShared, data: &mut [f32], channels: usize, ended: &SourceEndedSender) {
    let frames = (data.len() / channels.max(1)) as u64;
    let position = shared.position.load(Ordering::Acquire);
    match shared.mixer.try_lock() {
        Some(mut mixer) => mixer.render(data, channels, position, |id| {
            let _ = ended.try_send(id);
        }),
        None => data.fill(0.0),
    }
    shared.position.fetch_add(frames, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(values: &[f32]) -> Arc<[f32]> {
        values.to_vec().into()
    }

    #[test]
    fn renders_source_at_absolute_offset() {
        let mut mixer = OutputMixer::default();
        mixer.add(SourceId(1), 6, samples(&[0.5, 0.25, 0.125]));

        let mut ended = Vec::new();
        let mut block = vec![9.0f32; 8];
        mixer.render(&mut block, 1, 0, |id| ended.push(id));
        assert_eq!(block, vec![0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.5, 0.25]);
        assert!(ended.is_empty());

        let mut block = vec![0.0f32; 8];
        mixer.render(&mut block, 1, 8, |id| ended.push(id));
        assert_eq!(block[0], 0.125);
        assert_eq!(ended, vec![SourceId(1)]);
        assert!(mixer.is_empty());
    }

    #[test]
    fn duplicates_mono_into_every_channel() {
        let mut mixer = OutputMixer::default();
        mixer.add(SourceId(7), 0, samples(&[0.3, -0.3]));
        let mut block = vec![0.0f32; 4];
        mixer.render(&mut block, 2, 0, |_| {});
        assert_eq!(block, vec![0.3, 0.3, -0.3, -0.3]);
    }

    #[test]
    fn late_source_skips_elapsed_frames() {
        let mut mixer = OutputMixer::default();
        mixer.add(SourceId(2), 2, samples(&[0.1, 0.2, 0.3, 0.4]));
        let mut block = vec![0.0f32; 2];
        mixer.render(&mut block, 1, 4, |_| {});
        assert_eq!(block, vec![0.3, 0.4]);
    }

    fn tenth_at_24k(value: f32) -> DecodedBuffer {
        DecodedBuffer::new(vec![value; 2_400], 24_000)
    }

    #[test]
    fn back_to_back_sources_on_a_48k_device_leave_no_gap() {
        let mut timeline = OutputTimeline::new(48_000);
        let mut mixer = OutputMixer::default();

        let first = tenth_at_24k(0.5);
        let (start, samples) = timeline.place(&first, 0.0).unwrap();
        assert_eq!((start, samples.len()), (0, 4_800));
        mixer.add(SourceId(0), start, samples);

        let (start, samples) = timeline
            .place(&tenth_at_24k(0.5), first.duration_secs())
            .unwrap();
        assert_eq!((start, samples.len()), (4_800, 4_800));
        mixer.add(SourceId(1), start, samples);

        let mut ended = Vec::new();
        let mut block = vec![0.0f32; 9_600];
        mixer.render(&mut block, 1, 0, |id| ended.push(id));

        let silent: Vec<usize> = (0..block.len()).filter(|&i| block[i].abs() < 0.25).collect();
        assert!(silent.is_empty(), "silent frames at {silent:?}");
        assert!(block.iter().all(|s| (s - 0.5).abs() < 1e-3));
        assert_eq!(ended, vec![SourceId(0), SourceId(1)]);
    }

    #[test]
    fn sources_fill_exactly_their_slot_at_44k1() {
        let mut timeline = OutputTimeline::new(44_100);
        let mut t = 0.37;
        let mut expected_start = (t * 44_100.0_f64).round() as u64;
        for _ in 0..5 {
            let buffer = tenth_at_24k(0.2);
            let (start, samples) = timeline.place(&buffer, t).unwrap();
            assert_eq!(start, expected_start);
            t += buffer.duration_secs();
            expected_start = start + samples.len() as u64;
            assert_eq!(expected_start, (t * 44_100.0_f64).round() as u64);
        }
    }

    #[test]
    fn native_rate_shares_the_decoded_samples() {
        let mut timeline = OutputTimeline::new(24_000);
        let buffer = tenth_at_24k(0.1);
        let (start, samples) = timeline.place(&buffer, 1.0).unwrap();
        assert_eq!(start, 24_000);
        assert!(Arc::ptr_eq(&samples, &buffer.samples));
    }

    #[test]
    fn removed_source_is_silent_and_not_reported() {
        let mut mixer = OutputMixer::default();
        mixer.add(SourceId(3), 0, samples(&[0.9; 16]));
        assert!(mixer.remove(SourceId(3)));
        assert!(!mixer.remove(SourceId(3)));

        let mut ended = Vec::new();
        let mut block = vec![0.0f32; 16];
        mixer.render(&mut block, 1, 0, |id| ended.push(id));
        assert!(block.iter().all(|s| *s == 0.0));
        assert!(ended.is_empty());
    }
}
