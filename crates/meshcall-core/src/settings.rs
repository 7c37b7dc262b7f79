use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::controls::MediaConstraints;

/// How crossing offers between two peers are settled.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GlarePolicy {
    /// Only the side with the smaller client id offers. The other side
    /// answers, and a crossing offer from a peer that offers anyway is
    /// ignored by the smaller id.
    #[default]
    Polite,
    /// Apply whatever arrives. A collision usually fails the session.
    Unresolved,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub display_name: Option<String>,
    /// Origin of the relay; `https` upgrades to `wss`, `http` to `ws`.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    #[serde(default = "default_ice_servers")]
    pub ice_servers: Vec<IceServer>,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
    #[serde(default = "default_video_width")]
    pub video_width: u32,
    #[serde(default = "default_video_height")]
    pub video_height: u32,
    #[serde(default = "default_true")]
    pub mic_enabled_on_join: bool,
    #[serde(default = "default_true")]
    pub camera_enabled_on_join: bool,
    #[serde(default)]
    pub glare_policy: GlarePolicy,
    /// Fail a peer that is still negotiating after this long. Off when unset.
    #[serde(default)]
    pub negotiation_timeout_ms: Option<u64>,
    #[serde(default = "default_teardown_timeout_ms")]
    pub teardown_timeout_ms: u64,
    #[serde(default = "default_data_channel_label")]
    pub data_channel_label: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_relay_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_ice_servers() -> Vec<IceServer> {
    vec![IceServer {
        urls: vec!["stun:stun.l.google.com:19302".to_string()],
        username: None,
        credential: None,
    }]
}

fn default_video_width() -> u32 {
    1280
}

fn default_video_height() -> u32 {
    720
}

fn default_teardown_timeout_ms() -> u64 {
    2_000
}

fn default_data_channel_label() -> Option<String> {
    Some("chat".to_string())
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: None,
            relay_url: default_relay_url(),
            ice_servers: default_ice_servers(),
            noise_suppression: true,
            echo_cancellation: true,
            auto_gain_control: true,
            video_width: default_video_width(),
            video_height: default_video_height(),
            mic_enabled_on_join: true,
            camera_enabled_on_join: true,
            glare_policy: GlarePolicy::default(),
            negotiation_timeout_ms: None,
            teardown_timeout_ms: default_teardown_timeout_ms(),
            data_channel_label: default_data_channel_label(),
        }
    }
}

impl Settings {
    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            audio: true,
            video: true,
            noise_suppression: self.noise_suppression,
            echo_cancellation: self.echo_cancellation,
            auto_gain_control: self.auto_gain_control,
            width: self.video_width,
            height: self.video_height,
            audio_enabled_initially: self.mic_enabled_on_join,
            video_enabled_initially: self.camera_enabled_on_join,
        }
    }

    pub fn negotiation_timeout(&self) -> Option<Duration> {
        self.negotiation_timeout_ms.map(Duration::from_millis)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }
}

/// Settings persisted as `settings.json` in a data directory.
pub struct SettingsStore {
    settings: Mutex<Settings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        let file_path = data_dir.as_ref().join("settings.json");
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> Settings {
        self.lock().clone()
    }

    pub fn set_display_name(&self, name: Option<String>) {
        self.lock().display_name = name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        self.save();
    }

    pub fn set_relay_url(&self, url: String) {
        self.lock().relay_url = url;
        self.save();
    }

    pub fn set_audio_processing(&self, noise_suppression: bool, echo_cancellation: bool, auto_gain_control: bool) {
        {
            let mut settings = self.lock();
            settings.noise_suppression = noise_suppression;
            settings.echo_cancellation = echo_cancellation;
            settings.auto_gain_control = auto_gain_control;
        }
        self.save();
    }

    pub fn set_mic_enabled_on_join(&self, enabled: bool) {
        self.lock().mic_enabled_on_join = enabled;
        self.save();
    }

    pub fn set_camera_enabled_on_join(&self, enabled: bool) {
        self.lock().camera_enabled_on_join = enabled;
        self.save();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Settings> {
        self.settings.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self) {
        let settings = self.get();
        if let Some(parent) = self.file_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!("cannot create settings dir {}: {e}", parent.display());
                return;
            }
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("cannot write {}: {e}", self.file_path.display());
                }
            }
            Err(e) => tracing::warn!("cannot encode settings: {e}"),
        }
    }

    fn load(path: &Path) -> Settings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable {}: {e}", path.display());
                Settings::default()
            }),
            Err(_) => Settings::default(),
        }
    }
}
