//! Audio device enumeration and selection.

use serde::{Deserialize, Serialize};

/// Which side of the bridge a device serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceDirection {
    Input,
    Output,
}

/// Metadata about an audio device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    /// Human-readable device name reported by the OS.
    pub name: String,
    pub direction: DeviceDirection,
    /// Whether this is the system default device for its direction.
    pub is_default: bool,
    /// Heuristic flag for inputs that capture system output instead of a mic.
    pub is_loopback_like: bool,
}

const LOOPBACK_KEYWORDS: &[&str] = &[
    "stereo mix",
    "wave out",
    "what u hear",
    "what you hear",
    "loopback",
    "monitor of",
];

/// Best-effort heuristic for loopback/system-output capture devices.
///
/// Capturing one of these would feed the agent's own voice back upstream.
pub fn is_loopback_like_name(name: &str) -> bool {
    let lowered = name.trim().to_ascii_lowercase();
    LOOPBACK_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Pick a device by preferred name, falling back to the default device and
/// then the first enumerated one.
#[cfg(feature = "audio-cpal")]
pub(crate) fn select_device(
    direction: DeviceDirection,
    preferred_name: Option<&str>,
) -> crate::error::Result<cpal::Device> {
    use crate::error::BridgeError;
    use cpal::traits::{DeviceTrait, HostTrait};
    use tracing::warn;

    let host = cpal::default_host();

    let listed = match direction {
        DeviceDirection::Input => host.input_devices().map(|d| d.collect::<Vec<_>>()),
        DeviceDirection::Output => host.output_devices().map(|d| d.collect::<Vec<_>>()),
    };

    if let Some(preferred) = preferred_name {
        match &listed {
            Ok(devices) => {
                if let Some(found) = devices
                    .iter()
                    .find(|d| d.name().map(|n| n == preferred).unwrap_or(false))
                {
                    return Ok(found.clone());
                }
                warn!(?direction, "preferred device '{preferred}' not found, falling back");
            }
            Err(e) => warn!(?direction, "failed to list devices while resolving preference: {e}"),
        }
    }

    let default = match direction {
        DeviceDirection::Input => host.default_input_device(),
        DeviceDirection::Output => host.default_output_device(),
    };
    if let Some(device) = default {
        return Ok(device);
    }

    let missing = || match direction {
        DeviceDirection::Input => BridgeError::NoDefaultInputDevice,
        DeviceDirection::Output => BridgeError::NoDefaultOutputDevice,
    };
    let devices = listed.map_err(|e| BridgeError::AudioDevice(e.to_string()))?;
    let fallback = devices.into_iter().next().ok_or_else(missing)?;
    warn!(?direction, "no default device, falling back to first available");
    Ok(fallback)
}

/// List audio devices for one direction, default first.
///
/// Returns an empty `Vec` if cpal is not available or no devices exist.
#[cfg(feature = "audio-cpal")]
pub fn list_devices(direction: DeviceDirection) -> Vec<DeviceInfo> {
    use cpal::traits::{DeviceTrait, HostTrait};

    let host = cpal::default_host();
    let (default_name, devices) = match direction {
        DeviceDirection::Input => (
            host.default_input_device().and_then(|d| d.name().ok()),
            host.input_devices().map(|d| d.collect::<Vec<_>>()),
        ),
        DeviceDirection::Output => (
            host.default_output_device().and_then(|d| d.name().ok()),
            host.output_devices().map(|d| d.collect::<Vec<_>>()),
        ),
    };

    let devices = match devices {
        Ok(devices) => devices,
        Err(e) => {
            tracing::warn!("failed to enumerate {direction:?} devices: {e}");
            return Vec::new();
        }
    };

    let mut list = devices
        .iter()
        .enumerate()
        .map(|(idx, device)| {
            let name = device
                .name()
                .unwrap_or_else(|_| format!("{direction:?} Device {}", idx + 1));
            DeviceInfo {
                is_default: default_name.as_deref() == Some(name.as_str()),
                is_loopback_like: direction == DeviceDirection::Input
                    && is_loopback_like_name(&name),
                direction,
                name,
            }
        })
        .collect::<Vec<_>>();

    list.sort_by_key(|d| (!d.is_default, d.is_loopback_like, d.name.to_ascii_lowercase()));
    list
}

#[cfg(not(feature = "audio-cpal"))]
pub fn list_devices(_direction: DeviceDirection) -> Vec<DeviceInfo> {
    vec![]
}
