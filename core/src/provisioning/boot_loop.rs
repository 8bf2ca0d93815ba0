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

//! Detects a device that keeps rebooting shortly after starting and forces it into provisioning.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info, warn};
use serde::Serialize;

use crate::clock::Clock;

pub const BOOT_LOOP_WINDOW_MS: u64 = 120_000;
pub const BOOT_LOOP_THRESHOLD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootLoopReport {
    pub boots_in_window: usize,
    pub loop_detected: bool,
}

pub struct BootLoopDetector {
    history_path: PathBuf,
    force_marker: PathBuf,
    window_ms: u64,
    threshold: usize,
    clock: Arc<dyn Clock>,
}

impl BootLoopDetector {
    pub fn new(history_path: impl Into<PathBuf>, force_marker: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            history_path: history_path.into(),
            force_marker: force_marker.into(),
            window_ms: BOOT_LOOP_WINDOW_MS,
            threshold: BOOT_LOOP_THRESHOLD,
            clock,
        }
    }

    fn read_history(&self) -> Vec<u64> {
        std::fs::read_to_string(&self.history_path)
            .ok()
            .and_then(|contents| serde_json::from_str(&contents).ok())
            .unwrap_or_default()
    }

    /// Records this boot and reports whether too many boots happened within the window.
    ///
    /// On a detected loop the force-provisioning marker is written.
    pub fn record_boot(&self) -> BootLoopReport {
        let now = self.clock.now_ms();
        let mut history = self.read_history();
        history.push(now);
        history.retain(|ts| now.saturating_sub(*ts) <= self.window_ms);

        let saved = serde_json::to_string(&history)
            .map_err(io::Error::other)
            .and_then(|json| std::fs::write(&self.history_path, json));
        if let Err(e) = saved {
            error!("Failed to save reboot history {}: {}", self.history_path.display(), e);
        }

        let loop_detected = history.len() >= self.threshold;
        if loop_detected {
            warn!("Detected {} boots within {} s", history.len(), self.window_ms / 1000);
            match std::fs::write(&self.force_marker, "true") {
                Ok(()) => info!("Created force provisioning marker {}", self.force_marker.display()),
                Err(e) => error!("Failed to create marker {}: {}", self.force_marker.display(), e),
            }
        }
        BootLoopReport { boots_in_window: history.len(), loop_detected }
    }

    /// Forgets the boot history and removes the force-provisioning marker.
    pub fn clear(&self) -> io::Result<()> {
        for path in [&self.history_path, &self.force_marker] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        info!("Reboot history cleared");
        Ok(())
    }
}
