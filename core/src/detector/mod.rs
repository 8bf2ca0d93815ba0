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

//! Display attachment detection.
//!
//! Several independent probes are asked whether a display is attached. Their definite answers
//! are weighed against each other; when nobody can tell, a recent on-disk reading is reused, and
//! as a last resort the display is assumed to be present.

pub mod probes;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::config::DetectorConfig;
pub use probes::{default_probes, ConnectivityProbe};

pub const METHOD_CACHE_FALLBACK: &str = "cache_fallback";
pub const METHOD_ASSUME_CONNECTED: &str = "fallback_assume_connected";
pub const METHOD_WEIGHTED_VOTE: &str = "weighted_vote";

const CACHE_FALLBACK_CONFIDENCE: f64 = 0.3;
const ASSUME_CONNECTED_CONFIDENCE: f64 = 0.1;
const WAIT_CONFIDENCE_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityReading {
    pub connected: bool,
    pub method: String,
    pub confidence: f64,
    #[serde(default)]
    pub cached: bool,
    #[serde(default)]
    pub timestamp_ms: u64,
}

impl ConnectivityReading {
    /// Whether a caller may trust this reading as "a display is attached".
    pub fn is_confidently_connected(&self) -> bool {
        self.connected && self.confidence > WAIT_CONFIDENCE_THRESHOLD
    }
}

/// A definite answer from one probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeVote {
    pub method: &'static str,
    pub weight: f64,
    pub connected: bool,
}

/// Weighted majority over the definite answers. `None` when there are no votes.
///
/// A tie counts as disconnected.
pub fn tally_votes(votes: &[ProbeVote], timestamp_ms: u64) -> Option<ConnectivityReading> {
    if votes.is_empty() {
        return None;
    }
    let (mut yes, mut no) = (0.0_f64, 0.0_f64);
    for vote in votes {
        if vote.connected {
            yes += vote.weight;
        } else {
            no += vote.weight;
        }
    }
    let total = yes + no;
    let connected = yes > no;
    let confidence = if total > 0.0 { (yes.max(no) / total).min(1.0) } else { 0.0 };
    let method = votes
        .iter()
        .find(|v| v.connected == connected)
        .map(|v| v.method)
        .unwrap_or(METHOD_WEIGHTED_VOTE);

    Some(ConnectivityReading {
        connected,
        method: method.to_string(),
        confidence,
        cached: false,
        timestamp_ms,
    })
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    timestamp: u64,
    result: ConnectivityReading,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub reading: ConnectivityReading,
    pub waited_ms: u64,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeAvailability {
    pub name: &'static str,
    pub weight: f64,
    pub available: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectorDiagnostics {
    pub reading: ConnectivityReading,
    pub cached_reading: Option<ConnectivityReading>,
    pub headless_override: bool,
    pub drm_path_exists: bool,
    pub cache_file_exists: bool,
    pub probes: Vec<ProbeAvailability>,
}

pub struct ConnectivityDetector {
    probes: Vec<Box<dyn ConnectivityProbe>>,
    cache_path: PathBuf,
    cache_expiry_ms: u64,
    drm_path: PathBuf,
    clock: Arc<dyn Clock>,
    memory: Mutex<Option<ConnectivityReading>>,
}

impl ConnectivityDetector {
    pub fn new(config: &DetectorConfig, cache_path: impl Into<PathBuf>) -> Self {
        Self::with_probes(default_probes(config), cache_path, Arc::new(SystemClock))
            .with_cache_expiry(Duration::from_millis(config.cache_expiry_ms))
            .with_drm_path(&config.drm_path)
    }

    pub fn with_probes(
        probes: Vec<Box<dyn ConnectivityProbe>>,
        cache_path: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let defaults = DetectorConfig::default();
        Self {
            probes,
            cache_path: cache_path.into(),
            cache_expiry_ms: defaults.cache_expiry_ms,
            drm_path: defaults.drm_path,
            clock,
            memory: Mutex::new(None),
        }
    }

    pub fn with_cache_expiry(mut self, expiry: Duration) -> Self {
        self.cache_expiry_ms = expiry.as_millis() as u64;
        self
    }

    fn with_drm_path(mut self, drm_path: &Path) -> Self {
        self.drm_path = drm_path.to_path_buf();
        self
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Current display state. Never fails.
    ///
    /// With `use_cache`, a reading younger than the cache expiry is returned without probing.
    pub async fn check(&self, use_cache: bool) -> ConnectivityReading {
        let now = self.clock.now_ms();
        if use_cache {
            let cached = match self.memory_reading(now) {
                Some(reading) => Some(reading),
                None => self.disk_reading(now).await,
            };
            if let Some(reading) = cached {
                debug!("Using cached display reading from {}", reading.method);
                return reading;
            }
        }

        let votes = self.collect_votes().await;
        match tally_votes(&votes, now) {
            Some(reading) => {
                self.store(&reading).await;
                reading
            }
            None => self.fallback_reading(now).await,
        }
    }

    async fn collect_votes(&self) -> Vec<ProbeVote> {
        let mut votes = Vec::with_capacity(self.probes.len());
        for probe in &self.probes {
            match probe.probe().await {
                Ok(Some(connected)) => votes.push(ProbeVote { method: probe.name(), weight: probe.weight(), connected }),
                Ok(None) => {}
                Err(e) => debug!("Display probe {} failed: {}", probe.name(), e),
            }
        }
        votes
    }

    async fn fallback_reading(&self, now: u64) -> ConnectivityReading {
        if let Some(cached) = self.disk_reading(now).await {
            return ConnectivityReading {
                connected: cached.connected,
                method: METHOD_CACHE_FALLBACK.to_string(),
                confidence: CACHE_FALLBACK_CONFIDENCE,
                cached: true,
                timestamp_ms: cached.timestamp_ms,
            };
        }
        warn!("No display probe gave an answer, assuming a display is attached");
        ConnectivityReading {
            connected: true,
            method: METHOD_ASSUME_CONNECTED.to_string(),
            confidence: ASSUME_CONNECTED_CONFIDENCE,
            cached: false,
            timestamp_ms: now,
        }
    }

    fn is_fresh(&self, timestamp: u64, now: u64) -> bool {
        now.saturating_sub(timestamp) < self.cache_expiry_ms
    }

    fn memory_reading(&self, now: u64) -> Option<ConnectivityReading> {
        let slot = self.memory.lock().ok()?;
        slot.as_ref()
            .filter(|r| self.is_fresh(r.timestamp_ms, now))
            .map(|r| ConnectivityReading { cached: true, ..r.clone() })
    }

    async fn disk_reading(&self, now: u64) -> Option<ConnectivityReading> {
        let contents = tokio::fs::read_to_string(&self.cache_path).await.ok()?;
        let cache: CacheFile = match serde_json::from_str(&contents) {
            Ok(cache) => cache,
            Err(e) => {
                debug!("Ignoring unreadable display cache {}: {}", self.cache_path.display(), e);
                return None;
            }
        };
        if !self.is_fresh(cache.timestamp, now) {
            return None;
        }
        Some(ConnectivityReading { cached: true, timestamp_ms: cache.timestamp, ..cache.result })
    }

    async fn store(&self, reading: &ConnectivityReading) {
        if let Ok(mut slot) = self.memory.lock() {
            *slot = Some(reading.clone());
        }
        let cache = CacheFile { timestamp: reading.timestamp_ms, result: reading.clone() };
        let written = match serde_json::to_string(&cache) {
            Ok(json) => tokio::fs::write(&self.cache_path, json).await,
            Err(e) => Err(std::io::Error::other(e)),
        };
        if let Err(e) = written {
            debug!("Failed to write display cache {}: {}", self.cache_path.display(), e);
        }
    }

    /// Polls fresh readings until a display is confidently attached or `timeout` passes.
    pub async fn wait_for(&self, timeout: Duration, interval: Duration) -> WaitOutcome {
        let started = tokio::time::Instant::now();
        info!("Waiting up to {:?} for a display", timeout);
        loop {
            let reading = self.check(false).await;
            let elapsed = started.elapsed();
            if reading.is_confidently_connected() {
                info!("Display attached after {} ms ({})", elapsed.as_millis(), reading.method);
                return WaitOutcome { reading, waited_ms: elapsed.as_millis() as u64, timed_out: false };
            }
            if elapsed >= timeout {
                info!(
                    "Display wait timed out after {} ms, last reading connected={}",
                    elapsed.as_millis(),
                    reading.connected
                );
                return WaitOutcome { reading, waited_ms: elapsed.as_millis() as u64, timed_out: true };
            }
            tokio::time::sleep(interval.min(timeout - elapsed)).await;
        }
    }

    pub async fn diagnostics(&self, headless_override: bool) -> DetectorDiagnostics {
        let reading = self.check(false).await;
        let cached_reading = self.disk_reading(self.clock.now_ms()).await;
        DetectorDiagnostics {
            reading,
            cached_reading,
            headless_override,
            drm_path_exists: self.drm_path.exists(),
            cache_file_exists: self.cache_path.exists(),
            probes: self
                .probes
                .iter()
                .map(|p| ProbeAvailability { name: p.name(), weight: p.weight(), available: p.is_available() })
                .collect(),
        }
    }
}
