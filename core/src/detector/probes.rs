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

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::config::DetectorConfig;

/// One independent signal about whether a display is attached.
///
/// `Ok(None)` means the probe could not tell; errors are treated the same way by the detector.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    fn name(&self) -> &'static str;

    /// Relative reliability used when votes are summed.
    fn weight(&self) -> f64;

    fn is_available(&self) -> bool {
        true
    }

    async fn probe(&self) -> io::Result<Option<bool>>;
}

async fn read_status(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok().map(|s| s.trim().to_string())
}

async fn list_dir_names(path: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        names.push(entry.file_name().to_string_lossy().into_owned());
    }
    Ok(names)
}

/// DRM connectors whose name mentions HDMI.
pub struct DrmHdmiProbe {
    drm_path: PathBuf,
}

impl DrmHdmiProbe {
    pub fn new(drm_path: impl Into<PathBuf>) -> Self {
        Self { drm_path: drm_path.into() }
    }
}

#[async_trait]
impl ConnectivityProbe for DrmHdmiProbe {
    fn name(&self) -> &'static str {
        "drm_hdmi_status"
    }

    fn weight(&self) -> f64 {
        1.0
    }

    async fn probe(&self) -> io::Result<Option<bool>> {
        if !self.drm_path.exists() {
            return Ok(None);
        }
        let ports: Vec<String> = list_dir_names(&self.drm_path)
            .await?
            .into_iter()
            .filter(|name| name.contains("HDMI"))
            .collect();

        for port in &ports {
            if read_status(&self.drm_path.join(port).join("status")).await.as_deref() == Some("connected") {
                return Ok(Some(true));
            }
        }
        Ok(if ports.is_empty() { None } else { Some(false) })
    }
}

/// Any `cardN-<connector>` entry reporting `connected`.
pub struct DrmConnectorProbe {
    drm_path: PathBuf,
}

impl DrmConnectorProbe {
    pub fn new(drm_path: impl Into<PathBuf>) -> Self {
        Self { drm_path: drm_path.into() }
    }
}

#[async_trait]
impl ConnectivityProbe for DrmConnectorProbe {
    fn name(&self) -> &'static str {
        "drm_connector_status"
    }

    fn weight(&self) -> f64 {
        0.9
    }

    async fn probe(&self) -> io::Result<Option<bool>> {
        if !self.drm_path.exists() {
            return Ok(None);
        }
        let connectors = list_dir_names(&self.drm_path)
            .await?
            .into_iter()
            .filter(|name| name.starts_with("card") && name.contains('-'));

        for connector in connectors {
            if read_status(&self.drm_path.join(connector).join("status")).await.as_deref() == Some("connected") {
                return Ok(Some(true));
            }
        }
        Ok(Some(false))
    }
}

/// Legacy framebuffer mode string; an unset mode means nothing is driving the output.
pub struct FramebufferModeProbe {
    mode_path: PathBuf,
}

impl FramebufferModeProbe {
    pub fn new(framebuffer_path: impl AsRef<Path>) -> Self {
        Self { mode_path: framebuffer_path.as_ref().join("mode") }
    }
}

#[async_trait]
impl ConnectivityProbe for FramebufferModeProbe {
    fn name(&self) -> &'static str {
        "fb_device_mode"
    }

    fn weight(&self) -> f64 {
        0.7
    }

    fn is_available(&self) -> bool {
        self.mode_path.exists()
    }

    async fn probe(&self) -> io::Result<Option<bool>> {
        if !self.mode_path.exists() {
            return Ok(None);
        }
        let mode = tokio::fs::read_to_string(&self.mode_path).await?;
        let mode = mode.trim();
        Ok(Some(!mode.is_empty() && mode != "0" && mode != "DMT"))
    }
}

/// Raspberry Pi firmware query. Bounded by a timeout since the tool can hang on a wedged VC.
pub struct VcgencmdProbe {
    program: String,
    timeout: Duration,
}

impl VcgencmdProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { program: "vcgencmd".to_string(), timeout }
    }

    pub fn with_program(program: impl Into<String>, timeout: Duration) -> Self {
        Self { program: program.into(), timeout }
    }
}

fn parse_display_power(stdout: &str) -> Option<bool> {
    if stdout.contains("display_power=1") {
        Some(true)
    } else if stdout.contains("display_power=0") {
        Some(false)
    } else {
        None
    }
}

#[async_trait]
impl ConnectivityProbe for VcgencmdProbe {
    fn name(&self) -> &'static str {
        "vcgencmd_display"
    }

    fn weight(&self) -> f64 {
        0.6
    }

    async fn probe(&self) -> io::Result<Option<bool>> {
        let child = Command::new(&self.program)
            .arg("display_power")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                debug!("{} did not answer within {:?}", self.program, self.timeout);
                return Ok(None);
            }
        };
        Ok(parse_display_power(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// An HDMI-CEC device node only shows up when the CEC adapter sees a sink.
pub struct CecPresenceProbe {
    device: PathBuf,
}

impl CecPresenceProbe {
    pub fn new(device: impl Into<PathBuf>) -> Self {
        Self { device: device.into() }
    }
}

#[async_trait]
impl ConnectivityProbe for CecPresenceProbe {
    fn name(&self) -> &'static str {
        "cec_presence"
    }

    fn weight(&self) -> f64 {
        0.5
    }

    fn is_available(&self) -> bool {
        self.device.exists()
    }

    async fn probe(&self) -> io::Result<Option<bool>> {
        Ok(Some(tokio::fs::metadata(&self.device).await.is_ok()))
    }
}

/// The stock probe set, most reliable first.
pub fn default_probes(config: &DetectorConfig) -> Vec<Box<dyn ConnectivityProbe>> {
    vec![
        Box::new(DrmHdmiProbe::new(&config.drm_path)),
        Box::new(DrmConnectorProbe::new(&config.drm_path)),
        Box::new(FramebufferModeProbe::new(&config.framebuffer_path)),
        Box::new(VcgencmdProbe::new(Duration::from_millis(config.vcgencmd_timeout_ms))),
        Box::new(CecPresenceProbe::new(&config.cec_device)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn connector(root: &Path, name: &str, status: &str) {
        let dir = root.join(name);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("status"), format!("{status}\n")).unwrap();
    }

    #[tokio::test]
    async fn hdmi_probe_reads_connector_status() {
        let drm = tempfile::tempdir().unwrap();
        connector(drm.path(), "card0-HDMI-A-1", "disconnected");
        connector(drm.path(), "card0-HDMI-A-2", "connected");

        assert_eq!(DrmHdmiProbe::new(drm.path()).probe().await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn hdmi_probe_without_hdmi_ports_is_unknown() {
        let drm = tempfile::tempdir().unwrap();
        connector(drm.path(), "card0-DSI-1", "connected");

        assert_eq!(DrmHdmiProbe::new(drm.path()).probe().await.unwrap(), None);
        assert_eq!(DrmConnectorProbe::new(drm.path()).probe().await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn connector_probe_reports_disconnected_when_nothing_is_connected() {
        let drm = tempfile::tempdir().unwrap();
        connector(drm.path(), "card1-HDMI-A-1", "disconnected");
        fs::create_dir_all(drm.path().join("renderD128")).unwrap();

        assert_eq!(DrmConnectorProbe::new(drm.path()).probe().await.unwrap(), Some(false));
        assert_eq!(DrmHdmiProbe::new(drm.path()).probe().await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn missing_drm_directory_is_unknown() {
        let drm = tempfile::tempdir().unwrap();
        let missing = drm.path().join("absent");
        assert_eq!(DrmHdmiProbe::new(&missing).probe().await.unwrap(), None);
        assert_eq!(DrmConnectorProbe::new(&missing).probe().await.unwrap(), None);
    }

    #[tokio::test]
    async fn framebuffer_default_modes_mean_disconnected() {
        let fb = tempfile::tempdir().unwrap();
        let probe = FramebufferModeProbe::new(fb.path());
        assert_eq!(probe.probe().await.unwrap(), None);
        assert!(!probe.is_available());

        fs::write(fb.path().join("mode"), "DMT\n").unwrap();
        assert_eq!(probe.probe().await.unwrap(), Some(false));

        fs::write(fb.path().join("mode"), "U:1920x1080p-60\n").unwrap();
        assert_eq!(probe.probe().await.unwrap(), Some(true));
    }

    #[tokio::test]
    async fn missing_vcgencmd_is_unknown() {
        let probe = VcgencmdProbe::with_program("definitely-not-a-real-vcgencmd", Duration::from_secs(1));
        assert_eq!(probe.probe().await.unwrap(), None);
    }

    #[test]
    fn display_power_output_is_parsed() {
        assert_eq!(parse_display_power("display_power=1\n"), Some(true));
        assert_eq!(parse_display_power("display_power=0\n"), Some(false));
        assert_eq!(parse_display_power("error"), None);
    }

    #[test]
    fn default_probes_are_ordered_by_weight() {
        let probes = default_probes(&DetectorConfig::default());
        let weights: Vec<f64> = probes.iter().map(|p| p.weight()).collect();
        let mut sorted = weights.clone();
        sorted.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert_eq!(weights, sorted);
        assert_eq!(probes[0].name(), "drm_hdmi_status");
    }
}
