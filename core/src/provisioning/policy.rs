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

//! The provisioning decision as an ordered list of rules. The first rule that matches decides.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::store::{Metadata, TriggerRecord};

pub const TRIGGER_HDMI_DISCONNECT: &str = "hdmi_disconnect";
pub const HDMI_DEBOUNCE_WINDOW_MS: u64 = 5 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionConditions {
    pub has_config: bool,
    pub has_credentials: bool,
    /// `None` when the display state is unknown.
    pub connectivity: Option<bool>,
    pub force_provisioning: bool,
    pub headless_override: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    ForceProvisioning,
    HeadlessOverride,
    MissingConfig,
    MissingCredentials,
    HdmiDisconnectFirstTime,
    HdmiDisconnectedTimeout,
    HdmiConnectedOrUnknown,
}

impl DecisionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionReason::ForceProvisioning => "force_provisioning",
            DecisionReason::HeadlessOverride => "headless_override",
            DecisionReason::MissingConfig => "missing_config",
            DecisionReason::MissingCredentials => "missing_credentials",
            DecisionReason::HdmiDisconnectFirstTime => "hdmi_disconnect_first_time",
            DecisionReason::HdmiDisconnectedTimeout => "hdmi_disconnected_timeout",
            DecisionReason::HdmiConnectedOrUnknown => "hdmi_connected_or_unknown",
        }
    }
}

impl std::fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningDecision {
    pub should_provision: bool,
    pub reason: DecisionReason,
    pub confidence: f64,
    #[serde(default)]
    pub wait_for_retry: bool,
}

impl ProvisioningDecision {
    fn provision(reason: DecisionReason, confidence: f64) -> Self {
        Self { should_provision: true, reason, confidence, wait_for_retry: false }
    }

    fn stay(reason: DecisionReason, confidence: f64) -> Self {
        Self { should_provision: false, reason, confidence, wait_for_retry: false }
    }
}

/// A trigger the caller should record once the decision is final.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingTrigger {
    pub kind: &'static str,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub decision: ProvisioningDecision,
    pub pending_trigger: Option<PendingTrigger>,
}

impl From<ProvisioningDecision> for Evaluation {
    fn from(decision: ProvisioningDecision) -> Self {
        Self { decision, pending_trigger: None }
    }
}

pub struct PolicyInput<'a> {
    pub conditions: &'a DecisionConditions,
    pub triggers: &'a [TriggerRecord],
    pub now_ms: u64,
}

impl PolicyInput<'_> {
    fn has_recent_trigger(&self, kind: &str, window_ms: u64) -> bool {
        self.triggers
            .iter()
            .any(|t| t.kind == kind && self.now_ms.saturating_sub(t.timestamp_ms) < window_ms)
    }
}

pub type Rule = fn(&PolicyInput) -> Option<Evaluation>;

fn force_provisioning(input: &PolicyInput) -> Option<Evaluation> {
    input
        .conditions
        .force_provisioning
        .then(|| ProvisioningDecision::provision(DecisionReason::ForceProvisioning, 1.0).into())
}

fn headless_override(input: &PolicyInput) -> Option<Evaluation> {
    input
        .conditions
        .headless_override
        .then(|| ProvisioningDecision::stay(DecisionReason::HeadlessOverride, 1.0).into())
}

fn missing_config(input: &PolicyInput) -> Option<Evaluation> {
    (!input.conditions.has_config).then(|| ProvisioningDecision::provision(DecisionReason::MissingConfig, 1.0).into())
}

fn missing_credentials(input: &PolicyInput) -> Option<Evaluation> {
    (!input.conditions.has_credentials)
        .then(|| ProvisioningDecision::provision(DecisionReason::MissingCredentials, 1.0).into())
}

/// A lost display gets one grace period before the device gives up on playback.
fn display_disconnected(input: &PolicyInput) -> Option<Evaluation> {
    if input.conditions.connectivity != Some(false) {
        return None;
    }
    if input.has_recent_trigger(TRIGGER_HDMI_DISCONNECT, HDMI_DEBOUNCE_WINDOW_MS) {
        return Some(ProvisioningDecision::provision(DecisionReason::HdmiDisconnectedTimeout, 0.9).into());
    }

    let mut metadata = Metadata::new();
    metadata.insert("hdmiConnected".to_string(), json!(false));
    Some(Evaluation {
        decision: ProvisioningDecision {
            should_provision: false,
            reason: DecisionReason::HdmiDisconnectFirstTime,
            confidence: 0.7,
            wait_for_retry: true,
        },
        pending_trigger: Some(PendingTrigger { kind: TRIGGER_HDMI_DISCONNECT, metadata }),
    })
}

pub const RULES: &[(&str, Rule)] = &[
    ("force_provisioning", force_provisioning),
    ("headless_override", headless_override),
    ("missing_config", missing_config),
    ("missing_credentials", missing_credentials),
    ("display_disconnected", display_disconnected),
];

/// Pure: the same input always yields the same evaluation.
pub fn evaluate(input: &PolicyInput) -> Evaluation {
    RULES
        .iter()
        .find_map(|(_, rule)| rule(input))
        .unwrap_or_else(|| ProvisioningDecision::stay(DecisionReason::HdmiConnectedOrUnknown, 0.8).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ready(connectivity: Option<bool>) -> DecisionConditions {
        DecisionConditions { has_config: true, has_credentials: true, connectivity, ..Default::default() }
    }

    fn eval(conditions: DecisionConditions, triggers: &[TriggerRecord], now_ms: u64) -> Evaluation {
        evaluate(&PolicyInput { conditions: &conditions, triggers, now_ms })
    }

    fn disconnect_at(ts: u64) -> TriggerRecord {
        TriggerRecord { id: "t".into(), kind: TRIGGER_HDMI_DISCONNECT.into(), timestamp_ms: ts, metadata: Metadata::new() }
    }

    #[test]
    fn force_beats_everything() {
        let conditions = DecisionConditions { force_provisioning: true, headless_override: true, ..ready(Some(true)) };
        let evaluation = eval(conditions, &[], 0);
        assert!(evaluation.decision.should_provision);
        assert_eq!(evaluation.decision.reason, DecisionReason::ForceProvisioning);
    }

    #[test]
    fn headless_override_beats_missing_config() {
        let conditions = DecisionConditions { headless_override: true, ..Default::default() };
        let decision = eval(conditions, &[], 0).decision;
        assert!(!decision.should_provision);
        assert_eq!(decision.reason, DecisionReason::HeadlessOverride);
    }

    #[test]
    fn config_is_checked_before_credentials_and_display() {
        let conditions = DecisionConditions { connectivity: Some(true), ..Default::default() };
        let decision = eval(conditions, &[], 0).decision;
        assert!(decision.should_provision);
        assert_eq!(decision.reason, DecisionReason::MissingConfig);

        let conditions = DecisionConditions { has_config: true, connectivity: Some(false), ..Default::default() };
        assert_eq!(eval(conditions, &[], 0).decision.reason, DecisionReason::MissingCredentials);
    }

    #[test]
    fn first_disconnect_waits_and_asks_for_a_trigger() {
        let evaluation = eval(ready(Some(false)), &[], 1_000_000);
        assert!(!evaluation.decision.should_provision);
        assert!(evaluation.decision.wait_for_retry);
        assert_eq!(evaluation.decision.confidence, 0.7);
        assert_eq!(evaluation.pending_trigger.unwrap().kind, TRIGGER_HDMI_DISCONNECT);
    }

    #[test]
    fn repeated_disconnect_within_window_provisions() {
        let evaluation = eval(ready(Some(false)), &[disconnect_at(1_000_000)], 1_000_000 + HDMI_DEBOUNCE_WINDOW_MS - 1);
        assert!(evaluation.decision.should_provision);
        assert_eq!(evaluation.decision.reason, DecisionReason::HdmiDisconnectedTimeout);
        assert!(evaluation.pending_trigger.is_none());
    }

    #[test]
    fn old_disconnect_trigger_does_not_count() {
        let evaluation = eval(ready(Some(false)), &[disconnect_at(1_000_000)], 1_000_000 + HDMI_DEBOUNCE_WINDOW_MS);
        assert_eq!(evaluation.decision.reason, DecisionReason::HdmiDisconnectFirstTime);
    }

    #[test]
    fn connected_or_unknown_runs_normally() {
        for connectivity in [Some(true), None] {
            let decision = eval(ready(connectivity), &[], 0).decision;
            assert!(!decision.should_provision);
            assert_eq!(decision.reason, DecisionReason::HdmiConnectedOrUnknown);
            assert_eq!(decision.confidence, 0.8);
        }
    }

    #[test]
    fn reasons_serialize_in_snake_case() {
        let json = serde_json::to_value(DecisionReason::HdmiDisconnectedTimeout).unwrap();
        assert_eq!(json, serde_json::json!("hdmi_disconnected_timeout"));
        assert_eq!(DecisionReason::MissingConfig.to_string(), "missing_config");
    }
}
