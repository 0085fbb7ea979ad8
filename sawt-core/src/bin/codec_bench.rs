fn main() {
    if let Err(e) = run() {
        eprintln!("codec bench failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    use sawt_core::{
        audio::{resample::resample_buffer, FRAME_SIZE, INPUT_SAMPLE_RATE},
        buffering::framer::FrameAssembler,
        codec::{self, InboundChunk},
    };
    use serde::Serialize;
    use std::path::{Path, PathBuf};
    use std::time::Instant;

    #[derive(Debug)]
    struct Args {
        input: Option<PathBuf>,
        seconds: f32,
        output: Option<PathBuf>,
    }

    #[derive(Debug, Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Report {
        source: String,
        source_rate: u32,
        audio_seconds: f64,
        frames: usize,
        encoded_bytes: usize,
        resample_ms: f64,
        encode_ms: f64,
        decode_ms: f64,
        realtime_factor: f64,
        max_round_trip_error: f32,
        decode_errors: usize,
    }

    fn parse_args() -> Result<Args, String> {
        let mut input: Option<PathBuf> = None;
        let mut seconds: f32 = 10.0;
        let mut output: Option<PathBuf> = None;

        let mut it = std::env::args().skip(1);
        while let Some(arg) = it.next() {
            match arg.as_str() {
                "--input" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --input".into());
                    };
                    input = Some(PathBuf::from(v));
                }
                "--seconds" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --seconds".into());
                    };
                    seconds = v
                        .parse::<f32>()
                        .map_err(|_| "invalid value for --seconds".to_string())?
                        .clamp(0.5, 600.0);
                }
                "--output" => {
                    let Some(v) = it.next() else {
                        return Err("missing value for --output".into());
                    };
                    output = Some(PathBuf::from(v));
                }
                "--help" | "-h" => {
                    println!(
                        "Usage: cargo run -p sawt-core --bin codec_bench -- \\
  [--input <file.wav>] [--seconds <n>] [--output <report.json>]"
                    );
                    std::process::exit(0);
                }
                other => {
                    return Err(format!("unknown argument: {other}"));
                }
            }
        }

        Ok(Args {
            input,
            seconds,
            output,
        })
    }

    fn read_wav_mono_f32(path: &Path) -> Result<(Vec<f32>, u32), String> {
        let mut reader = hound::WavReader::open(path).map_err(|e| e.to_string())?;
        let spec = reader.spec();
        let channels = usize::from(spec.channels.max(1));

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .map(|s| s.map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int if spec.bits_per_sample <= 16 => reader
                .samples::<i16>()
                .map(|s| s.map(|v| v as f32 / 32768.0).map_err(|e| e.to_string()))
                .collect::<Result<Vec<_>, _>>()?,
            hound::SampleFormat::Int => {
                let max = ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / max).map_err(|e| e.to_string()))
                    .collect::<Result<Vec<_>, _>>()?
            }
        };

        let mono = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect();
        Ok((mono, spec.sample_rate))
    }

    /// 440 Hz tone with a slow amplitude sweep, at 48 kHz.
    fn synth_tone(seconds: f32) -> (Vec<f32>, u32) {
        let rate = 48_000u32;
        let n = (seconds * rate as f32) as usize;
        let samples = (0..n)
            .map(|i| {
                let t = i as f32 / rate as f32;
                let env = 0.2 + 0.7 * (0.5 + 0.5 * (t * 0.5 * std::f32::consts::TAU).sin());
                env * (t * 440.0 * std::f32::consts::TAU).sin()
            })
            .collect();
        (samples, rate)
    }

    let args = parse_args()?;
    let (source, (samples, source_rate)) = match &args.input {
        Some(path) => (path.display().to_string(), read_wav_mono_f32(path)?),
        None => ("synthetic-440hz".to_string(), synth_tone(args.seconds)),
    };

    let t0 = Instant::now();
    let uplink = resample_buffer(&samples, source_rate, INPUT_SAMPLE_RATE).map_err(|e| e.to_string())?;
    let resample_ms = t0.elapsed().as_secs_f64() * 1000.0;

    let mut frames = Vec::new();
    let mut framer = FrameAssembler::new(FRAME_SIZE, INPUT_SAMPLE_RATE);
    framer.push(&uplink, |frame| frames.push(frame));

    let t1 = Instant::now();
    let encoded = frames.iter().map(codec::encode).collect::<Vec<_>>();
    let encode_ms = t1.elapsed().as_secs_f64() * 1000.0;
    let encoded_bytes = encoded.iter().map(|c| c.data.len()).sum();

    let t2 = Instant::now();
    let mut decode_errors = 0;
    let mut max_err = 0f32;
    for (seq, (frame, chunk)) in frames.iter().zip(encoded).enumerate() {
        match codec::decode(&InboundChunk::raw(chunk.data, seq as u64)) {
            Ok(buffer) => {
                for (a, b) in frame.samples.iter().zip(buffer.samples.iter()) {
                    max_err = max_err.max((a.clamp(-1.0, 1.0) - b).abs());
                }
            }
            Err(_) => decode_errors += 1,
        }
    }
    let decode_ms = t2.elapsed().as_secs_f64() * 1000.0;

    let audio_seconds = frames.len() as f64 * FRAME_SIZE as f64 / INPUT_SAMPLE_RATE as f64;
    let processing_secs = (resample_ms + encode_ms + decode_ms) / 1000.0;
    let report = Report {
        source,
        source_rate,
        audio_seconds,
        frames: frames.len(),
        encoded_bytes,
        resample_ms,
        encode_ms,
        decode_ms,
        realtime_factor: if processing_secs > 0.0 {
            audio_seconds / processing_secs
        } else {
            f64::INFINITY
        },
        max_round_trip_error: max_err,
        decode_errors,
    };

    let json = serde_json::to_string_pretty(&report).map_err(|e| e.to_string())?;
    match &args.output {
        Some(path) => std::fs::write(path, &json).map_err(|e| e.to_string())?,
        None => println!("{json}"),
    }
    Ok(())
}
