//! Sawt headless host.
//!
//! Opens the microphone and speakers, connects to the live voice agent (or
//! the echo loopback when no API key is configured) and logs session events.
//!
//! Keys on stdin: `m` + Enter toggles mute, `q` + Enter hangs up. Ctrl-C also
//! hangs up.

mod settings;

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use sawt_core::{
    audio::{
        device::{list_devices, DeviceDirection},
        CaptureConfig, OutputConfig,
    },
    transport::{Modality, SessionConfig},
    BridgeConfig, CpalBackend, EchoTransport, LiveTransport, SessionStatus, VoiceBridge,
};
use settings::{default_settings_path, load_settings, save_settings, AppSettings};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Log one level line per this many frames (≈ 4 s at 16 kHz / 4096).
const LEVEL_LOG_EVERY: u64 = 16;

struct Args {
    settings_path: PathBuf,
    force_echo: bool,
    list_devices: bool,
    write_settings: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        settings_path: default_settings_path(),
        force_echo: false,
        list_devices: false,
        write_settings: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--settings" => {
                let Some(v) = it.next() else {
                    bail!("missing value for --settings");
                };
                args.settings_path = PathBuf::from(v);
            }
            "--echo" => args.force_echo = true,
            "--list-devices" => args.list_devices = true,
            "--write-settings" => args.write_settings = true,
            "--help" | "-h" => {
                println!(
                    "Usage: sawt [--settings <file.json>] [--echo] [--list-devices] [--write-settings]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn bridge_config(settings: &AppSettings) -> BridgeConfig {
    BridgeConfig {
        capture: CaptureConfig {
            preferred_device: settings.preferred_input_device.clone(),
            ..CaptureConfig::default()
        },
        output: OutputConfig {
            preferred_device: settings.preferred_output_device.clone(),
            ..OutputConfig::default()
        },
        level_gain: settings.level_gain,
        session: SessionConfig {
            model: settings.model.clone(),
            response_modality: Modality::Audio,
            voice_name: settings.voice_name.clone(),
            system_instruction: settings.system_instruction.clone(),
        },
    }
}

fn print_devices() {
    for direction in [DeviceDirection::Input, DeviceDirection::Output] {
        for device in list_devices(direction) {
            match serde_json::to_string(&device) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!("device listing: {e}"),
            }
        }
    }
}

/// Reads control keys until EOF. Runs on a plain thread: stdin is blocking.
fn spawn_keyboard(bridge: Arc<VoiceBridge>) {
    let spawned = std::thread::Builder::new()
        .name("sawt-keys".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                match line.trim() {
                    "m" | "M" => {
                        let muted = bridge.toggle_mute();
                        println!("{}", if muted { "microphone muted" } else { "microphone live" });
                    }
                    "q" | "Q" => {
                        bridge.close();
                        break;
                    }
                    "" => {}
                    other => println!("unknown key {other:?}: m = mute, q = hang up"),
                }
                if bridge.status().is_terminal() {
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        warn!("keyboard controls unavailable: {e}");
    }
}

fn spawn_event_logging(bridge: &VoiceBridge) {
    let mut status_rx = bridge.subscribe_status();
    tokio::spawn(async move {
        loop {
            match status_rx.recv().await {
                Ok(event) => match &event.detail {
                    Some(detail) => info!(status = ?event.status, "{detail}"),
                    None => info!(status = ?event.status, "status changed"),
                },
                Err(RecvError::Lagged(n)) => warn!("status receiver lagged by {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut level_rx = bridge.subscribe_levels();
    tokio::spawn(async move {
        loop {
            match level_rx.recv().await {
                Ok(event) if event.seq % LEVEL_LOG_EVERY == 0 => {
                    debug!(level = event.level, muted = event.muted, "input level");
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── Tracing ───────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sawt=info")),
        )
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    let mut settings = load_settings(&args.settings_path);
    if args.write_settings {
        save_settings(&args.settings_path, &settings)
            .with_context(|| format!("writing {}", args.settings_path.display()))?;
        info!(path = %args.settings_path.display(), "settings written");
    }
    settings.apply_env_overrides();
    info!(
        path = %args.settings_path.display(),
        transport = %settings.transport,
        model = %settings.model,
        voice = %settings.voice_name,
        "Sawt starting"
    );

    let config = bridge_config(&settings);
    let live_key = settings
        .api_key
        .clone()
        .filter(|_| settings.transport == "live" && !args.force_echo);
    let bridge = Arc::new(match live_key {
        Some(key) => {
            let mut transport = LiveTransport::new(key);
            if let Some(endpoint) = &settings.endpoint {
                transport = transport.with_endpoint(endpoint.clone());
            }
            VoiceBridge::new(config, CpalBackend, transport)
        }
        None => {
            if settings.transport == "live" && !args.force_echo {
                warn!("no API key configured, falling back to the echo transport");
            }
            VoiceBridge::new(config, CpalBackend, EchoTransport)
        }
    });

    spawn_event_logging(&bridge);
    bridge.start().await.context("starting voice session")?;
    println!("m + Enter: toggle mute, q + Enter: hang up");
    spawn_keyboard(Arc::clone(&bridge));

    tokio::select! {
        _ = bridge.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, hanging up");
            bridge.close();
            bridge.wait().await;
        }
    }

    let diagnostics = bridge.diagnostics_snapshot();
    info!(?diagnostics, "session finished");

    if bridge.status() == SessionStatus::Error {
        bail!("session ended with an error");
    }
    Ok(())
}
