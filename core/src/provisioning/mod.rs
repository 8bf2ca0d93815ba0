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

//! Whether the device should run playback or fall back to provisioning, plus the persisted
//! trigger and session history that decision depends on.

pub mod boot_loop;
pub mod overrides;
pub mod policy;
pub mod store;

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{error, info, warn};
use serde::Serialize;
use serde_json::json;

use crate::clock::{Clock, SystemClock};
pub use policy::{DecisionConditions, DecisionReason, ProvisioningDecision};
pub use store::{
    Metadata, PersistedState, ProvisioningSession, SessionResult, SessionStatus, StateStore, TriggerRecord,
};

pub const SESSION_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const RECENT_COMPLETION_MS: u64 = 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryReason {
    SessionTimeout,
    RecentPowerCycle,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatus {
    pub needs_recovery: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<RecoveryReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_age_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_since_completion_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStatistics {
    pub total_triggers: u64,
    pub total_sessions: u64,
    pub successful_sessions: u64,
    pub current_session: Option<ProvisioningSession>,
    pub last_trigger: Option<TriggerRecord>,
    pub last_provisioning_start: Option<u64>,
    pub completed_sessions_count: usize,
}

fn process_metadata(mut metadata: Metadata) -> Metadata {
    metadata.insert("pid".to_string(), json!(std::process::id()));
    metadata.insert("platform".to_string(), json!(std::env::consts::OS));
    metadata.insert("agentVersion".to_string(), json!(env!("CARGO_PKG_VERSION")));
    metadata
}

fn short_id(len: usize) -> String {
    uuid::Uuid::new_v4().simple().to_string()[..len].to_string()
}

/// `prov-<hex millis>-<random>`
pub fn generate_session_id(now_ms: u64) -> String {
    format!("prov-{:x}-{}", now_ms, short_id(10))
}

pub struct ProvisioningStateMachine {
    store: StateStore,
    clock: Arc<dyn Clock>,
    state: Mutex<PersistedState>,
}

impl ProvisioningStateMachine {
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::with_store(StateStore::new(state_path, clock.clone()), clock)
    }

    pub fn with_store(store: StateStore, clock: Arc<dyn Clock>) -> Self {
        let state = store.load();
        Self { store, clock, state: Mutex::new(state) }
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads what is on disk, merges it with memory, applies `f`, trims and saves.
    fn update<R>(&self, f: impl FnOnce(&mut PersistedState, u64) -> R) -> R {
        let now = self.clock.now_ms();
        let mut guard = self.lock();
        let mut state = PersistedState::merge(self.store.load(), &guard);
        let out = f(&mut state, now);
        state.trim();
        if let Err(e) = self.store.save(&state) {
            error!("Failed to save provisioning state: {}", e);
        }
        *guard = state;
        out
    }

    /// Current view of the persisted history, including changes made by other writers.
    pub fn snapshot(&self) -> PersistedState {
        let guard = self.lock();
        PersistedState::merge(self.store.load(), &guard)
    }

    /// Evaluates the provisioning policy and records the debounce trigger when the policy asks for one.
    pub fn decide(&self, conditions: &DecisionConditions) -> ProvisioningDecision {
        let snapshot = self.snapshot();
        let evaluation = policy::evaluate(&policy::PolicyInput {
            conditions,
            triggers: &snapshot.triggers,
            now_ms: self.clock.now_ms(),
        });
        if let Some(trigger) = evaluation.pending_trigger {
            self.record_trigger(trigger.kind, trigger.metadata);
        }
        info!(
            "Provisioning decision: provision={} reason={} confidence={:.2}",
            evaluation.decision.should_provision, evaluation.decision.reason, evaluation.decision.confidence
        );
        evaluation.decision
    }

    pub fn record_trigger(&self, kind: &str, metadata: Metadata) -> TriggerRecord {
        self.update(|state, now| {
            let trigger = TriggerRecord {
                id: short_id(16),
                kind: kind.to_string(),
                timestamp_ms: now,
                metadata: process_metadata(metadata),
            };
            state.triggers.insert(0, trigger.clone());
            state.last_trigger = Some(trigger.clone());
            state.trigger_count += 1;
            trigger
        })
    }

    pub fn record_session_start(&self, session_id: &str, metadata: Metadata) -> ProvisioningSession {
        self.update(|state, now| {
            let session = ProvisioningSession {
                id: session_id.to_string(),
                start_time: now,
                end_time: None,
                duration_ms: None,
                status: SessionStatus::Active,
                result: None,
                metadata: process_metadata(metadata),
                completion_metadata: Metadata::new(),
            };
            state.current_session = Some(session.clone());
            state.last_provisioning_start = Some(now);
            session
        })
    }

    /// Closes the active session. Returns `None` (and changes nothing) when there is none.
    pub fn record_session_complete(&self, result: SessionResult, metadata: Metadata) -> Option<ProvisioningSession> {
        self.update(|state, now| {
            let Some(mut session) = state.current_session.take() else {
                warn!("No active provisioning session to complete");
                return None;
            };
            session.end_time = Some(now);
            session.duration_ms = Some(now.saturating_sub(session.start_time));
            session.status = SessionStatus::Completed;
            session.result = Some(result);
            session.completion_metadata = metadata;

            state.completed_sessions.insert(0, session.clone());
            state.total_sessions += 1;
            if result == SessionResult::Success {
                state.successful_sessions += 1;
            }
            Some(session)
        })
    }

    pub fn check_recovery(&self) -> RecoveryStatus {
        let state = self.snapshot();
        let now = self.clock.now_ms();

        if let Some(active) = &state.current_session {
            let age = now.saturating_sub(active.start_time);
            if age > SESSION_TIMEOUT_MS {
                return RecoveryStatus {
                    needs_recovery: true,
                    reason: Some(RecoveryReason::SessionTimeout),
                    session_age_ms: Some(age),
                    ..Default::default()
                };
            }
        }

        let last_end = state.completed_sessions.first().and_then(|s| s.end_time);
        if let Some(end) = last_end {
            let since = now.saturating_sub(end);
            if since < RECENT_COMPLETION_MS {
                return RecoveryStatus {
                    needs_recovery: true,
                    reason: Some(RecoveryReason::RecentPowerCycle),
                    time_since_completion_ms: Some(since),
                    ..Default::default()
                };
            }
        }
        RecoveryStatus::default()
    }

    pub fn statistics(&self) -> ProvisioningStatistics {
        let state = self.snapshot();
        ProvisioningStatistics {
            total_triggers: state.trigger_count,
            total_sessions: state.total_sessions,
            successful_sessions: state.successful_sessions,
            completed_sessions_count: state.completed_sessions.len(),
            current_session: state.current_session,
            last_trigger: state.last_trigger,
            last_provisioning_start: state.last_provisioning_start,
        }
    }

    /// Drops all history, in memory and on disk.
    pub fn clear(&self) {
        let mut guard = self.lock();
        *guard = PersistedState::new(self.clock.now_ms());
        if let Err(e) = self.store.save(&guard) {
            error!("Failed to save cleared provisioning state: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use policy::HDMI_DEBOUNCE_WINDOW_MS;

    const START: u64 = 1_700_000_000_000;

    fn machine(dir: &std::path::Path, clock: &Arc<ManualClock>) -> ProvisioningStateMachine {
        let store = StateStore::new(dir.join(".provisioning-state"), clock.clone());
        ProvisioningStateMachine::with_store(store, clock.clone())
    }

    fn ready(connectivity: Option<bool>) -> DecisionConditions {
        DecisionConditions { has_config: true, has_credentials: true, connectivity, ..Default::default() }
    }

    #[test]
    fn nothing_configured_with_display_attached_needs_config() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let decision = machine(dir.path(), &clock).decide(&DecisionConditions {
            connectivity: Some(true),
            ..Default::default()
        });
        assert!(decision.should_provision);
        assert_eq!(decision.reason, DecisionReason::MissingConfig);
    }

    #[test]
    fn decide_is_repeatable_without_new_triggers() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);
        let first = machine.decide(&ready(Some(true)));
        let second = machine.decide(&ready(Some(true)));
        assert_eq!(first, second);
        assert_eq!(machine.statistics().total_triggers, 0);
    }

    #[test]
    fn display_loss_is_debounced_once() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);

        let first = machine.decide(&ready(Some(false)));
        assert!(!first.should_provision);
        assert!(first.wait_for_retry);
        assert_eq!(first.reason, DecisionReason::HdmiDisconnectFirstTime);

        clock.advance(10_000);
        let second = machine.decide(&ready(Some(false)));
        assert!(second.should_provision);
        assert_eq!(second.reason, DecisionReason::HdmiDisconnectedTimeout);

        clock.advance(HDMI_DEBOUNCE_WINDOW_MS);
        assert_eq!(machine.decide(&ready(Some(false))).reason, DecisionReason::HdmiDisconnectFirstTime);
    }

    #[test]
    fn debounce_trigger_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        machine(dir.path(), &clock).decide(&ready(Some(false)));

        clock.advance(1_000);
        let restarted = machine(dir.path(), &clock);
        assert_eq!(restarted.decide(&ready(Some(false))).reason, DecisionReason::HdmiDisconnectedTimeout);
    }

    #[test]
    fn trigger_ring_keeps_newest_ten() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);
        for i in 0..13 {
            clock.advance(1);
            machine.record_trigger(&format!("t{i}"), Metadata::new());
        }
        let state = machine.snapshot();
        assert_eq!(state.triggers.len(), store::TRIGGER_HISTORY_CAPACITY);
        assert_eq!(state.triggers[0].kind, "t12");
        assert_eq!(state.triggers[9].kind, "t3");
        assert_eq!(state.trigger_count, 13);
        assert_eq!(state.triggers[0].metadata.get("pid"), Some(&json!(std::process::id())));
    }

    #[test]
    fn session_lifecycle_updates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);

        assert!(machine.record_session_complete(SessionResult::Success, Metadata::new()).is_none());

        let id = generate_session_id(START);
        machine.record_session_start(&id, Metadata::new());
        clock.advance(4_000);
        let done = machine.record_session_complete(SessionResult::Success, Metadata::new()).unwrap();
        assert_eq!(done.duration_ms, Some(4_000));
        assert_eq!(done.status, SessionStatus::Completed);

        let stats = machine.statistics();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.successful_sessions, 1);
        assert_eq!(stats.completed_sessions_count, 1);
        assert!(stats.current_session.is_none());
        assert_eq!(stats.last_provisioning_start, Some(START));
    }

    #[test]
    fn abandoned_session_needs_recovery() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);
        machine.record_session_start("prov-a", Metadata::new());

        clock.advance(SESSION_TIMEOUT_MS);
        assert!(!machine.check_recovery().needs_recovery);

        clock.advance(1);
        let status = machine.check_recovery();
        assert!(status.needs_recovery);
        assert_eq!(status.reason, Some(RecoveryReason::SessionTimeout));
    }

    #[test]
    fn fresh_completion_looks_like_a_power_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);
        machine.record_session_start("prov-b", Metadata::new());
        machine.record_session_complete(SessionResult::Failure, Metadata::new());

        clock.advance(59_000);
        let status = machine.check_recovery();
        assert_eq!(status.reason, Some(RecoveryReason::RecentPowerCycle));
        assert_eq!(status.time_since_completion_ms, Some(59_000));

        clock.advance(1_000);
        assert!(!machine.check_recovery().needs_recovery);
    }

    #[test]
    fn clear_forgets_everything() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let machine = machine(dir.path(), &clock);
        machine.record_trigger("manual", Metadata::new());
        machine.clear();

        assert_eq!(machine.statistics().total_triggers, 0);
        assert!(machine.snapshot().triggers.is_empty());
    }

    #[test]
    fn session_ids_have_the_expected_shape() {
        let id = generate_session_id(255);
        assert!(id.starts_with("prov-ff-"));
        assert_eq!(id.len(), "prov-ff-".len() + 10);
        assert_ne!(generate_session_id(255), id);
    }
}
