//! Persistent host settings (JSON file in the app data directory).

use std::fs;
use std::path::{Path, PathBuf};

use sawt_core::{
    engine::DEFAULT_LEVEL_GAIN,
    transport::{DEFAULT_MODEL, DEFAULT_VOICE},
};
use serde::{Deserialize, Serialize};

/// Persona shipped with the host: a Saudi legal advisor speaking white Saudi dialect.
pub const DEFAULT_SYSTEM_INSTRUCTION: &str = "أنت مستشار قانوني سعودي (رجل). تحدث بنبرة صوتية رزينة ومهنية. استخدم اللهجة السعودية البيضاء والمصطلحات القانونية الدقيقة عند الحاجة. هدفك هو مساعدة المستخدم صوتياً.";

/// Environment variables checked, in order, for the live API key.
const API_KEY_VARS: [&str; 3] = ["SAWT_API_KEY", "GEMINI_API_KEY", "API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    /// `"live"` or `"echo"`.
    pub transport: String,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub level_gain: f32,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            preferred_input_device: None,
            preferred_output_device: None,
            transport: "live".into(),
            endpoint: None,
            api_key: None,
            model: DEFAULT_MODEL.into(),
            voice_name: DEFAULT_VOICE.into(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.into(),
            level_gain: DEFAULT_LEVEL_GAIN,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.transport = normalize_transport(&self.transport);
        self.model = normalize_model(&self.model);
        if self.voice_name.trim().is_empty() {
            self.voice_name = DEFAULT_VOICE.into();
        } else {
            self.voice_name = self.voice_name.trim().to_string();
        }
        self.level_gain = if self.level_gain.is_finite() {
            self.level_gain.clamp(0.5, 20.0)
        } else {
            DEFAULT_LEVEL_GAIN
        };
        self.api_key = trimmed(self.api_key.as_deref());
        self.endpoint = trimmed(self.endpoint.as_deref());
        self.preferred_input_device = trimmed(self.preferred_input_device.as_deref());
        self.preferred_output_device = trimmed(self.preferred_output_device.as_deref());
    }

    /// Environment wins over the file for the key and the transport choice.
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = API_KEY_VARS
            .iter()
            .find_map(|var| trimmed(std::env::var(var).ok().as_deref()))
        {
            self.api_key = Some(key);
        }
        if let Ok(transport) = std::env::var("SAWT_TRANSPORT") {
            self.transport = normalize_transport(&transport);
        }
    }
}

fn trimmed(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

pub fn normalize_transport(raw: &str) -> String {
    match raw.trim().to_ascii_lowercase().as_str() {
        "echo" | "loopback" | "offline" => "echo".into(),
        _ => "live".into(),
    }
}

/// The live service addresses models as `models/<name>`.
pub fn normalize_model(raw: &str) -> String {
    let model = raw.trim();
    if model.is_empty() {
        DEFAULT_MODEL.into()
    } else if model.starts_with("models/") {
        model.into()
    } else {
        format!("models/{model}")
    }
}

pub fn default_settings_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Sawt")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".local")
                    .join("share")
            })
            .join("sawt")
            .join("settings.json")
    }
}

pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| serde_json::from_str::<AppSettings>(&raw).ok())
        .unwrap_or_default();
    settings.normalize();
    settings
}

pub fn save_settings(path: &Path, settings: &AppSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings).map_err(std::io::Error::other)?;
    fs::write(path, json)
}
