// Copyright 2025 HEM Sp. z o.o.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Agent configuration: the JSON config file, the credentials file and environment overrides.

use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::player::coordinates::CoordinateTable;
use crate::player::PlayerTimings;

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const CREDENTIALS_FILE_NAME: &str = "credentials.json";
pub const HDMI_CACHE_FILE_NAME: &str = ".hdmi-cache";
pub const PROVISIONING_STATE_FILE_NAME: &str = ".provisioning-state";
pub const HEADLESS_MARKER_FILE_NAME: &str = ".headless_ok";
pub const REBOOT_HISTORY_FILE_NAME: &str = ".reboot_history";
pub const DEFAULT_FORCE_MARKER_PATH: &str = "/tmp/force_provisioning";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DetectorConfig {
    pub drm_path: PathBuf,
    pub framebuffer_path: PathBuf,
    pub cec_device: PathBuf,
    pub cache_expiry_ms: u64,
    pub vcgencmd_timeout_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            drm_path: PathBuf::from("/sys/class/drm"),
            framebuffer_path: PathBuf::from("/sys/class/graphics/fb0"),
            cec_device: PathBuf::from("/dev/cec0"),
            cache_expiry_ms: 30_000,
            vcgencmd_timeout_ms: 3_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BrowserConfig {
    pub executable_path: Option<PathBuf>,
    pub headless: bool,
    pub remote_debugging_port: u16,
    pub user_data_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
    pub launch_timeout_ms: u64,
    pub navigation_timeout_ms: u64,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            executable_path: None,
            headless: false,
            remote_debugging_port: 9222,
            user_data_dir: None,
            extra_args: Vec::new(),
            launch_timeout_ms: 20_000,
            navigation_timeout_ms: 45_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoginConfig {
    pub url: String,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self { url: "https://live.veo.co/login".to_string() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Local endpoint of the primary (request/response) transport.
    pub ipc_endpoint: Option<String>,
    /// Base URL of the relay hub used for queued messages and telemetry.
    pub hub_url: Option<String>,
    pub sas_token: Option<String>,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
    pub api_version: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ipc_endpoint: None,
            hub_url: None,
            sas_token: None,
            poll_interval_ms: 5_000,
            request_timeout_ms: 10_000,
            api_version: "2020-09-30".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AgentConfig {
    pub device_id: String,
    pub stream_url: Option<String>,
    pub state_dir: PathBuf,
    pub force_marker_path: PathBuf,
    pub show_click_overlay: bool,
    pub detector: DetectorConfig,
    pub browser: BrowserConfig,
    pub login: LoginConfig,
    pub coordinates: Option<CoordinateTable>,
    pub timings: PlayerTimings,
    pub channel: ChannelConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: "kiosk-001".to_string(),
            stream_url: None,
            state_dir: PathBuf::from("/var/lib/kiosk-agent"),
            force_marker_path: PathBuf::from(DEFAULT_FORCE_MARKER_PATH),
            show_click_overlay: false,
            detector: DetectorConfig::default(),
            browser: BrowserConfig::default(),
            login: LoginConfig::default(),
            coordinates: None,
            timings: PlayerTimings::default(),
            channel: ChannelConfig::default(),
        }
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl AgentConfig {
    /// Reads the config file. `Ok(None)` means the file does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ConfigError::Io { path: path.to_path_buf(), source }),
        };
        let config = serde_json::from_str(&contents)
            .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
        debug!("Loaded configuration from {}", path.display());
        Ok(Some(config))
    }

    /// Like [`AgentConfig::load`], but a missing or unusable file yields the default config,
    /// which is incomplete and so leads to provisioning.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(Some(config)) => config,
            Ok(None) => {
                warn!("No configuration at {}", path.display());
                Self::default()
            }
            Err(e) => {
                warn!("Ignoring unusable configuration: {}", e);
                Self::default()
            }
        }
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(url) = non_empty_env("KIOSK_STREAM_URL") {
            self.stream_url = Some(url);
        }
        if let Some(id) = non_empty_env("KIOSK_DEVICE_ID") {
            self.device_id = id;
        }
        if let Some(hub) = non_empty_env("KIOSK_HUB_URL") {
            self.channel.hub_url = Some(hub);
        }
        if let Some(token) = non_empty_env("KIOSK_HUB_TOKEN") {
            self.channel.sas_token = Some(token);
        }
        if let Some(endpoint) = non_empty_env("KIOSK_IPC_ENDPOINT") {
            self.channel.ipc_endpoint = Some(endpoint);
        }
        if let Some(overlay) = non_empty_env("SHOW_CLICK_OVERLAY") {
            self.show_click_overlay = overlay != "false";
        }
    }

    /// A usable config names something to play or a hub to take orders from.
    pub fn is_complete(&self) -> bool {
        let named = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        named(&self.stream_url) || named(&self.channel.hub_url)
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        self.state_dir.join(name)
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"***")
            .finish()
    }
}

impl Credentials {
    pub fn is_valid(&self) -> bool {
        !self.email.trim().is_empty() && !self.password.is_empty()
    }

    /// Reads the credentials file; any problem yields `None`.
    pub fn load(path: &Path) -> Option<Self> {
        let contents = std::fs::read_to_string(path).ok()?;
        match serde_json::from_str::<Credentials>(&contents) {
            Ok(creds) if creds.is_valid() => Some(creds),
            Ok(_) => {
                warn!("Credentials in {} are incomplete", path.display());
                None
            }
            Err(e) => {
                warn!("Failed to parse credentials from {}: {}", path.display(), e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_config_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = AgentConfig::load(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn partial_config_is_filled_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, r#"{"streamUrl": "https://example.com/live", "browser": {"headless": true}}"#).unwrap();

        let config = AgentConfig::load(&path).unwrap().unwrap();
        assert!(config.is_complete());
        assert!(config.browser.headless);
        assert_eq!(config.browser.remote_debugging_port, 9222);
        assert_eq!(config.detector.cache_expiry_ms, 30_000);
    }

    #[test]
    fn coordinate_table_keys_are_read_from_json_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(
            &path,
            r#"{"coordinates": {"1920": {"play": {"x": 10, "y": 20}, "fullscreen": {"x": 30, "y": 40}}}}"#,
        )
        .unwrap();

        let config = AgentConfig::load(&path).unwrap().unwrap();
        let table = config.coordinates.as_ref().unwrap();
        assert_eq!(table.get(&1920).unwrap().play.x, 10);
        assert!(!config.is_complete());
    }

    #[test]
    fn malformed_config_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(AgentConfig::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn unusable_config_falls_back_to_an_incomplete_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        assert_eq!(AgentConfig::load_or_default(&path), AgentConfig::default());

        fs::write(&path, "{bad").unwrap();
        let config = AgentConfig::load_or_default(&path);
        assert_eq!(config, AgentConfig::default());
        assert!(!config.is_complete());
    }

    #[test]
    fn credentials_require_email_and_password() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CREDENTIALS_FILE_NAME);

        fs::write(&path, r#"{"email": "ops@example.com", "password": ""}"#).unwrap();
        assert!(Credentials::load(&path).is_none());

        fs::write(&path, r#"{"email": "ops@example.com", "password": "secret"}"#).unwrap();
        let creds = Credentials::load(&path).unwrap();
        assert_eq!(creds.email, "ops@example.com");
        assert!(!format!("{:?}", creds).contains("secret"));
    }
}
