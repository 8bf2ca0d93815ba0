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

use log::info;

pub const FORCE_PROVISIONING_ENV: &str = "FORCE_PROVISIONING";

/// Operator-controlled switches that short-circuit the provisioning decision.
#[derive(Debug, Clone)]
pub struct OverrideMarkers {
    force_marker: PathBuf,
    headless_marker: PathBuf,
}

impl OverrideMarkers {
    pub fn new(force_marker: impl Into<PathBuf>, headless_marker: impl Into<PathBuf>) -> Self {
        Self { force_marker: force_marker.into(), headless_marker: headless_marker.into() }
    }

    pub fn force_marker(&self) -> &Path {
        &self.force_marker
    }

    pub fn headless_marker(&self) -> &Path {
        &self.headless_marker
    }

    pub fn force_provisioning(&self) -> bool {
        std::env::var(FORCE_PROVISIONING_ENV).is_ok_and(|v| v == "true") || self.force_marker.exists()
    }

    pub fn headless_override(&self) -> bool {
        self.headless_marker.exists()
    }

    pub fn enable_headless(&self) -> io::Result<()> {
        std::fs::write(&self.headless_marker, "Enabled by kiosk agent\n")?;
        info!("Headless override enabled ({})", self.headless_marker.display());
        Ok(())
    }

    pub fn disable_headless(&self) -> io::Result<()> {
        match std::fs::remove_file(&self.headless_marker) {
            Ok(()) => {
                info!("Headless override disabled ({})", self.headless_marker.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headless_marker_can_be_toggled() {
        let dir = tempfile::tempdir().unwrap();
        let markers = OverrideMarkers::new(dir.path().join("force"), dir.path().join(".headless_ok"));
        assert!(!markers.headless_override());

        markers.enable_headless().unwrap();
        assert!(markers.headless_override());

        markers.disable_headless().unwrap();
        assert!(!markers.headless_override());
        markers.disable_headless().unwrap();
    }

    #[test]
    fn force_marker_file_forces_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let markers = OverrideMarkers::new(dir.path().join("force"), dir.path().join(".headless_ok"));
        std::fs::write(markers.force_marker(), "true").unwrap();
        assert!(markers.force_provisioning());
    }
}
