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

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::process::{Child, Command};

use super::PlayerError;
use crate::config::BrowserConfig;

pub const CHROMIUM_PATH_ENV: &str = "CHROMIUM_PATH";

const WELL_KNOWN_BROWSERS: &[&str] = &["/usr/bin/chromium-browser", "/usr/bin/chromium", "/usr/bin/google-chrome-stable"];

const KIOSK_ARGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--kiosk",
    "--start-fullscreen",
    "--hide-scrollbars",
    "--disable-infobars",
    "--disable-web-security",
    "--autoplay-policy=no-user-gesture-required",
    "--ignore-certificate-errors",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--enable-features=VaapiVideoDecoder",
    "--use-gl=egl",
    "--ignore-gpu-blocklist",
    "--no-first-run",
    "--no-default-browser-check",
];

const WSL_ARGS: &[&str] = &["--disable-features=VizDisplayCompositor", "--no-zygote"];

/// Browser candidates in lookup order: environment override, configured path, well-known installs.
pub fn browser_candidates(env_override: Option<String>, configured: Option<&Path>) -> Vec<PathBuf> {
    env_override
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .into_iter()
        .chain(configured.map(Path::to_path_buf))
        .chain(WELL_KNOWN_BROWSERS.iter().map(PathBuf::from))
        .collect()
}

pub fn locate_browser_executable(configured: Option<&Path>) -> Result<PathBuf, PlayerError> {
    let candidates = browser_candidates(std::env::var(CHROMIUM_PATH_ENV).ok(), configured);
    candidates.iter().find(|c| c.exists()).cloned().ok_or_else(|| {
        let checked: Vec<String> = candidates.iter().map(|c| c.display().to_string()).collect();
        PlayerError::BrowserNotFound(checked.join(", "))
    })
}

/// Windows Subsystem for Linux needs a couple of compositor workarounds.
pub fn is_wsl() -> bool {
    if let Ok(env) = std::env::var("RUNTIME_ENV") {
        return env.eq_ignore_ascii_case("wsl");
    }
    std::fs::read_to_string("/proc/version")
        .map(|v| v.to_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

pub fn launch_args(config: &BrowserConfig, user_data_dir: &Path, wsl: bool) -> Vec<String> {
    let mut args: Vec<String> = KIOSK_ARGS.iter().map(|a| a.to_string()).collect();
    if wsl {
        args.extend(WSL_ARGS.iter().map(|a| a.to_string()));
    }
    if config.headless {
        args.push("--headless=new".to_string());
    }
    args.push(format!("--remote-debugging-port={}", config.remote_debugging_port));
    args.push(format!("--user-data-dir={}", user_data_dir.display()));
    args.extend(config.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TargetInfo {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    web_socket_debugger_url: Option<String>,
}

fn first_page_socket(targets: &[TargetInfo]) -> Option<String> {
    targets
        .iter()
        .filter(|t| t.kind == "page")
        .find_map(|t| t.web_socket_debugger_url.clone())
}

pub struct BrowserProcess {
    child: Child,
    debugging_port: u16,
}

impl BrowserProcess {
    pub async fn launch(config: &BrowserConfig) -> Result<Self, PlayerError> {
        let executable = locate_browser_executable(config.executable_path.as_deref())?;
        let user_data_dir = config
            .user_data_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("kiosk-agent-browser"));
        let args = launch_args(config, &user_data_dir, is_wsl());
        info!("Launching {}", executable.display());
        debug!("Browser arguments: {:?}", args);

        let mut command = Command::new(&executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if std::env::var_os("DISPLAY").is_none() {
            command.env("DISPLAY", ":0");
        }
        let child = command.spawn().map_err(PlayerError::Launch)?;
        Ok(Self { child, debugging_port: config.remote_debugging_port })
    }

    /// Polls the DevTools target list until a page target shows up.
    pub async fn page_websocket_url(&mut self, timeout: Duration) -> Result<String, PlayerError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| PlayerError::Navigation(e.to_string()))?;
        let list_url = format!("http://127.0.0.1:{}/json/list", self.debugging_port);
        let deadline = tokio::time::Instant::now() + timeout;

        while tokio::time::Instant::now() < deadline {
            if let Ok(Some(status)) = self.child.try_wait() {
                return Err(PlayerError::Exited(status.to_string()));
            }
            match http.get(&list_url).send().await {
                Ok(response) => match response.json::<Vec<TargetInfo>>().await {
                    Ok(targets) => {
                        if let Some(url) = first_page_socket(&targets) {
                            return Ok(url);
                        }
                    }
                    Err(e) => debug!("Unexpected DevTools target list: {}", e),
                },
                Err(e) => debug!("DevTools not reachable yet: {}", e),
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        Err(PlayerError::NoPage(timeout))
    }

    pub async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!("Failed to stop browser: {}", e);
        }
    }
}
