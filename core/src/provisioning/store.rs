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

use std::collections::HashSet;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::clock::Clock;

pub const STATE_VERSION: &str = "1.0";
pub const TRIGGER_HISTORY_CAPACITY: usize = 10;
pub const COMPLETED_SESSIONS_CAPACITY: usize = 5;
pub const DEFAULT_LOCK_STALE_AFTER: Duration = Duration::from_secs(5);

pub type Metadata = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionResult {
    Success,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningSession {
    pub id: String,
    pub start_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<SessionResult>,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub completion_metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PersistedState {
    pub version: String,
    pub created: u64,
    pub triggers: Vec<TriggerRecord>,
    pub completed_sessions: Vec<ProvisioningSession>,
    pub current_session: Option<ProvisioningSession>,
    pub last_trigger: Option<TriggerRecord>,
    pub last_provisioning_start: Option<u64>,
    pub trigger_count: u64,
    pub total_sessions: u64,
    pub successful_sessions: u64,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl PersistedState {
    pub fn new(created: u64) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            created,
            triggers: Vec::new(),
            completed_sessions: Vec::new(),
            current_session: None,
            last_trigger: None,
            last_provisioning_start: None,
            trigger_count: 0,
            total_sessions: 0,
            successful_sessions: 0,
        }
    }

    /// Keeps both rings newest first and within capacity.
    pub fn trim(&mut self) {
        self.triggers.sort_by(|a, b| b.timestamp_ms.cmp(&a.timestamp_ms));
        self.triggers.truncate(TRIGGER_HISTORY_CAPACITY);
        self.completed_sessions.sort_by(|a, b| b.end_time.cmp(&a.end_time));
        self.completed_sessions.truncate(COMPLETED_SESSIONS_CAPACITY);
    }

    /// Combines what another writer may have saved with what this process holds in memory.
    ///
    /// Histories are unioned by id, counters take the larger value, and a session that either
    /// side has completed is no longer considered active.
    pub fn merge(disk: PersistedState, memory: &PersistedState) -> PersistedState {
        let mut merged = PersistedState::new(match (disk.created, memory.created) {
            (0, m) => m,
            (d, 0) => d,
            (d, m) => d.min(m),
        });

        let mut seen = HashSet::new();
        merged.triggers = memory
            .triggers
            .iter()
            .cloned()
            .chain(disk.triggers)
            .filter(|t| seen.insert(t.id.clone()))
            .collect();

        let mut seen = HashSet::new();
        merged.completed_sessions = memory
            .completed_sessions
            .iter()
            .cloned()
            .chain(disk.completed_sessions)
            .filter(|s| seen.insert(s.id.clone()))
            .collect();

        merged.current_session = match (disk.current_session, memory.current_session.clone()) {
            (Some(d), Some(m)) => Some(if d.start_time > m.start_time { d } else { m }),
            (d, m) => m.or(d),
        }
        .filter(|active| !seen.contains(&active.id));

        merged.last_trigger = match (disk.last_trigger, memory.last_trigger.clone()) {
            (Some(d), Some(m)) => Some(if d.timestamp_ms > m.timestamp_ms { d } else { m }),
            (d, m) => m.or(d),
        };
        merged.last_provisioning_start = disk.last_provisioning_start.max(memory.last_provisioning_start);
        merged.trigger_count = disk.trigger_count.max(memory.trigger_count);
        merged.total_sessions = disk.total_sessions.max(memory.total_sessions);
        merged.successful_sessions = disk.successful_sessions.max(memory.successful_sessions);
        merged.trim();
        merged
    }
}

#[derive(Error, Debug)]
pub enum StateStoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to serialize provisioning state: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Provisioning state is locked by another writer ({age_ms} ms old lock)")]
    Locked { age_ms: u64 },
}

/// JSON file holding [`PersistedState`], guarded by a sentinel lock file.
///
/// The lock marks a write in progress. Readers that find a fresh lock fall back to an empty
/// state instead of reading a possibly half-written file, and writers give up on the save. A lock
/// older than the staleness window is assumed to belong to a writer that died and is removed.
pub struct StateStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let path = path.into();
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self { path, lock_path, lock_stale_after: DEFAULT_LOCK_STALE_AFTER, clock }
    }

    pub fn with_lock_stale_after(mut self, stale_after: Duration) -> Self {
        self.lock_stale_after = stale_after;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    fn lock_age_ms(&self) -> Option<u64> {
        let contents = std::fs::read_to_string(&self.lock_path).ok()?;
        let written = match contents.trim().parse::<u64>() {
            Ok(ts) => ts,
            Err(_) => std::fs::metadata(&self.lock_path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        };
        Some(self.clock.now_ms().saturating_sub(written))
    }

    /// Reads the state file. Any problem yields a fresh default state.
    pub fn load(&self) -> PersistedState {
        let now = self.clock.now_ms();
        if !self.path.exists() {
            return PersistedState::new(now);
        }

        if let Some(age) = self.lock_age_ms() {
            if age < self.lock_stale_after.as_millis() as u64 {
                warn!("Provisioning state is locked by another writer, using defaults");
                return PersistedState::new(now);
            }
            self.remove_stale_lock(age);
        }

        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read provisioning state {}: {}", self.path.display(), e);
                return PersistedState::new(now);
            }
        };
        match serde_json::from_str::<PersistedState>(&contents) {
            Ok(state) => state,
            Err(e) => {
                warn!("Invalid provisioning state in {}, using defaults: {}", self.path.display(), e);
                PersistedState::new(now)
            }
        }
    }

    fn remove_stale_lock(&self, age_ms: u64) {
        debug!("Removing stale lock {} ({} ms old)", self.lock_path.display(), age_ms);
        if let Err(e) = std::fs::remove_file(&self.lock_path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove stale lock {}: {}", self.lock_path.display(), e);
            }
        }
    }

    /// Creates the lock file. Fails with [`StateStoreError::Locked`] while another writer holds a fresh lock.
    fn acquire_lock(&self) -> Result<(), StateStoreError> {
        if let Some(age_ms) = self.lock_age_ms() {
            if age_ms < self.lock_stale_after.as_millis() as u64 {
                return Err(StateStoreError::Locked { age_ms });
            }
            self.remove_stale_lock(age_ms);
        }

        let mut file = match std::fs::OpenOptions::new().write(true).create_new(true).open(&self.lock_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Err(StateStoreError::Locked { age_ms: 0 }),
            Err(source) => return Err(StateStoreError::Io { path: self.lock_path.clone(), source }),
        };
        file.write_all(self.clock.now_ms().to_string().as_bytes())
            .map_err(|source| StateStoreError::Io { path: self.lock_path.clone(), source })
    }

    /// Writes `state` under the lock. A fresh lock held by another writer is left alone.
    pub fn save(&self, state: &PersistedState) -> Result<(), StateStoreError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| StateStoreError::Io { path, source }
        };

        let json = serde_json::to_string_pretty(state)?;
        self.acquire_lock()?;
        let written = std::fs::write(&self.path, json).map_err(io_err(&self.path));
        let unlocked = std::fs::remove_file(&self.lock_path).map_err(io_err(&self.lock_path));
        written.and(unlocked)
    }
}
