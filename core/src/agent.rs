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

//! Boot flow and lifetime of the device agent.
//!
//! On boot the agent records the boot for loop detection, reads the display state, and asks the
//! provisioning policy whether the device is ready for kiosk playback. In kiosk mode it starts the
//! player, wires the command channel to it and keeps running until shutdown.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde_json::{json, Value};

use crate::channel::{Command, CommandChannel, CommandHandler, CommandOutcome};
use crate::clock::{Clock, SystemClock};
use crate::config::{
    AgentConfig, Credentials, CONFIG_FILE_NAME, CREDENTIALS_FILE_NAME, HDMI_CACHE_FILE_NAME, HEADLESS_MARKER_FILE_NAME, PROVISIONING_STATE_FILE_NAME,
    REBOOT_HISTORY_FILE_NAME,
};
use crate::detector::{ConnectivityDetector, ConnectivityReading, METHOD_ASSUME_CONNECTED};
use crate::player::{ControlOutcome, PlayerController};
use crate::provisioning::boot_loop::{BootLoopDetector, BootLoopReport};
use crate::provisioning::overrides::OverrideMarkers;
use crate::provisioning::{
    generate_session_id, DecisionConditions, Metadata, ProvisioningDecision, ProvisioningStateMachine,
    RecoveryReason, SessionResult,
};
use crate::service::{spawn_service, ServiceHandle};

const DISPLAY_WAIT: Duration = Duration::from_secs(10);
const DISPLAY_RETRY_WAIT: Duration = Duration::from_secs(30);
const DISPLAY_POLL_INTERVAL: Duration = Duration::from_secs(1);
const DISPLAY_WATCH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub enum BootOutcome {
    /// The device has to hand over to the provisioning service.
    Provision(ProvisioningDecision),
    Kiosk(ProvisioningDecision),
}

impl BootOutcome {
    pub fn decision(&self) -> &ProvisioningDecision {
        match self {
            BootOutcome::Provision(d) | BootOutcome::Kiosk(d) => d,
        }
    }
}

/// Routes channel commands to the player.
pub struct PlayerCommandHandler {
    player: Arc<PlayerController>,
}

impl PlayerCommandHandler {
    pub fn new(player: Arc<PlayerController>) -> Self {
        Self { player }
    }
}

fn command_outcome(command: Command, outcome: ControlOutcome) -> CommandOutcome {
    let message = format!("{command}: {outcome}");
    if outcome.is_success() {
        CommandOutcome::ok(message)
    } else {
        CommandOutcome::failed(message)
    }
}

#[async_trait]
impl CommandHandler for PlayerCommandHandler {
    async fn handle(&self, command: Command, payload: &Value) -> anyhow::Result<CommandOutcome> {
        debug!("Handling {} ({})", command, payload);
        let outcome = match command {
            Command::Play => self.player.play().await,
            Command::Pause => self.player.pause().await,
            Command::Fullscreen => self.player.fullscreen().await,
            Command::Restart => self.player.reload().await,
            Command::Status => {
                let status = self.player.status().await;
                return Ok(CommandOutcome::ok("status").with_data(serde_json::to_value(status)?));
            }
        };
        Ok(command_outcome(command, outcome))
    }
}

/// Maps a reading to the policy's view: the hard "assume connected" default means "unknown".
fn connectivity_of(reading: &ConnectivityReading) -> Option<bool> {
    if reading.method == METHOD_ASSUME_CONNECTED {
        None
    } else {
        Some(reading.connected)
    }
}

pub struct Agent {
    config: AgentConfig,
    credentials: Option<Credentials>,
    clock: Arc<dyn Clock>,
    detector: Arc<ConnectivityDetector>,
    provisioning: ProvisioningStateMachine,
    markers: OverrideMarkers,
    boot_loop: BootLoopDetector,
    player: Arc<PlayerController>,
    channel: Arc<CommandChannel>,
    display_wait: Duration,
    display_retry_wait: Duration,
    watcher: tokio::sync::Mutex<Option<ServiceHandle>>,
}

impl Agent {
    /// Reads `config.json` and `credentials.json` from `config_dir`, applies environment overrides
    /// and prepares the state directory. An unusable config file is treated as absent.
    pub fn from_config_dir(config_dir: &Path, state_dir: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = AgentConfig::load_or_default(&config_dir.join(CONFIG_FILE_NAME));
        config.apply_env_overrides();
        if let Some(state_dir) = state_dir {
            config.state_dir = state_dir.to_path_buf();
        }
        std::fs::create_dir_all(&config.state_dir)
            .with_context(|| format!("Failed to create state directory {}", config.state_dir.display()))?;

        let credentials = Credentials::load(&config_dir.join(CREDENTIALS_FILE_NAME));
        if credentials.is_none() {
            warn!("No usable credentials in {}", config_dir.display());
        }
        Self::new(config, credentials)
    }

    pub fn new(config: AgentConfig, credentials: Option<Credentials>) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let detector = ConnectivityDetector::new(&config.detector, config.state_file(HDMI_CACHE_FILE_NAME));
        let provisioning = ProvisioningStateMachine::new(config.state_file(PROVISIONING_STATE_FILE_NAME));
        let markers = OverrideMarkers::new(&config.force_marker_path, config.state_file(HEADLESS_MARKER_FILE_NAME));
        let boot_loop = BootLoopDetector::new(
            config.state_file(REBOOT_HISTORY_FILE_NAME),
            &config.force_marker_path,
            clock.clone(),
        );
        let player = PlayerController::new(&config, credentials.clone());
        let channel = CommandChannel::new(config.device_id.clone(), config.channel.clone())
            .context("Failed to set up command channel")?;

        Ok(Self {
            config,
            credentials,
            clock,
            detector: Arc::new(detector),
            provisioning,
            markers,
            boot_loop,
            player: Arc::new(player),
            channel: Arc::new(channel),
            display_wait: DISPLAY_WAIT,
            display_retry_wait: DISPLAY_RETRY_WAIT,
            watcher: tokio::sync::Mutex::new(None),
        })
    }

    pub fn with_detector(mut self, detector: ConnectivityDetector) -> Self {
        self.detector = Arc::new(detector);
        self
    }

    pub fn with_player(mut self, player: PlayerController) -> Self {
        self.player = Arc::new(player);
        self
    }

    /// How long to wait for a display before deciding, and again after a first disconnect.
    pub fn with_display_waits(mut self, initial: Duration, retry: Duration) -> Self {
        self.display_wait = initial;
        self.display_retry_wait = retry;
        self
    }

    pub fn detector(&self) -> &ConnectivityDetector {
        &self.detector
    }

    pub fn provisioning(&self) -> &ProvisioningStateMachine {
        &self.provisioning
    }

    pub fn markers(&self) -> &OverrideMarkers {
        &self.markers
    }

    pub fn boot_loop(&self) -> &BootLoopDetector {
        &self.boot_loop
    }

    pub fn player(&self) -> &Arc<PlayerController> {
        &self.player
    }

    pub fn channel(&self) -> &Arc<CommandChannel> {
        &self.channel
    }

    pub fn conditions(&self, connectivity: Option<bool>) -> DecisionConditions {
        DecisionConditions {
            has_config: self.config.is_complete(),
            has_credentials: self.credentials.as_ref().is_some_and(Credentials::is_valid),
            connectivity,
            force_provisioning: self.markers.force_provisioning(),
            headless_override: self.markers.headless_override(),
        }
    }

    /// Waits for the display, then evaluates the policy; a first disconnect is re-checked once.
    pub async fn decide(&self) -> (ProvisioningDecision, ConnectivityReading) {
        let mut reading = self.detector.wait_for(self.display_wait, DISPLAY_POLL_INTERVAL).await.reading;
        let mut decision = self.provisioning.decide(&self.conditions(connectivity_of(&reading)));
        if decision.wait_for_retry {
            info!("Display disconnected, checking again within {:?}", self.display_retry_wait);
            reading = self.detector.wait_for(self.display_retry_wait, DISPLAY_POLL_INTERVAL).await.reading;
            decision = self.provisioning.decide(&self.conditions(connectivity_of(&reading)));
        }
        (decision, reading)
    }

    fn settle_previous_session(&self, decision: &ProvisioningDecision) {
        let recovery = self.provisioning.check_recovery();
        match recovery.reason {
            Some(RecoveryReason::SessionTimeout) => {
                warn!("Provisioning session abandoned after {:?} ms", recovery.session_age_ms);
                self.provisioning
                    .record_session_complete(SessionResult::Failure, metadata(json!({"reason": "session_timeout"})));
            }
            Some(RecoveryReason::RecentPowerCycle) => {
                warn!(
                    "Device restarted {:?} ms after provisioning completed",
                    recovery.time_since_completion_ms
                );
            }
            None => {}
        }
        if !decision.should_provision && self.provisioning.snapshot().current_session.is_some() {
            info!("Device is ready, closing the open provisioning session");
            self.provisioning
                .record_session_complete(SessionResult::Success, metadata(json!({"reason": decision.reason})));
        }
    }

    /// Runs the boot flow. Only a failed browser launch is an error.
    pub async fn boot(&self) -> anyhow::Result<BootOutcome> {
        let BootLoopReport { boots_in_window, loop_detected } = self.boot_loop.record_boot();
        if loop_detected {
            warn!("Boot loop detected ({} boots), forcing provisioning", boots_in_window);
        }

        let (decision, reading) = self.decide().await;
        self.settle_previous_session(&decision);

        if decision.should_provision {
            let session_id = generate_session_id(self.clock.now_ms());
            self.provisioning.record_session_start(
                &session_id,
                metadata(json!({"reason": decision.reason, "confidence": decision.confidence})),
            );
            info!("Handing over to provisioning (session {})", session_id);
            return Ok(BootOutcome::Provision(decision));
        }

        self.player.launch().await.context("Failed to launch browser")?;
        if let Err(e) = self.channel.register_handler(Arc::new(PlayerCommandHandler::new(self.player.clone()))) {
            debug!("{}", e);
        }
        if let Err(e) = self.channel.connect().await {
            error!("Command channel unavailable: {}", e);
        }

        match self.config.stream_url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => {
                let outcome = self.player.go_to_stream(url).await;
                info!("Stream started: {}", outcome);
            }
            None => warn!("No stream URL configured, waiting for commands"),
        }

        self.channel
            .send_telemetry(json!({
                "event": "boot",
                "decision": decision,
                "display": reading,
            }))
            .await;
        self.start_display_watch().await;
        Ok(BootOutcome::Kiosk(decision))
    }

    /// Reports display changes while in kiosk mode.
    async fn start_display_watch(&self) {
        let mut watcher = self.watcher.lock().await;
        if watcher.is_some() {
            return;
        }
        let detector = self.detector.clone();
        let channel = self.channel.clone();
        *watcher = Some(spawn_service(move |mut stop| async move {
            let mut last = detector.check(true).await.connected;
            while !stop.sleep_or_stop(DISPLAY_WATCH_INTERVAL).await {
                let reading = detector.check(false).await;
                if reading.connected != last {
                    info!("Display {} ({})", if reading.connected { "attached" } else { "detached" }, reading.method);
                    last = reading.connected;
                    channel.send_telemetry(json!({"event": "display", "display": reading})).await;
                }
            }
        }));
    }

    /// Boots, then stays in kiosk mode until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> anyhow::Result<BootOutcome>
    where
        F: Future<Output = ()>,
    {
        let outcome = self.boot().await?;
        if let BootOutcome::Kiosk(_) = outcome {
            shutdown.await;
            info!("Shutdown requested");
            self.shutdown().await;
        }
        Ok(outcome)
    }

    pub async fn shutdown(&self) {
        if let Some(watcher) = self.watcher.lock().await.take() {
            if let Err(e) = watcher.shutdown().await {
                warn!("Display watch ended abnormally: {}", e);
            }
        }
        self.channel.disconnect().await;
        self.player.close().await;
        info!("Agent stopped");
    }
}

fn metadata(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        _ => Metadata::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::detector::ConnectivityProbe;
    use crate::player::fake::FakePage;
    use crate::player::PlayerTimings;
    use crate::provisioning::DecisionReason;
    use std::io;
    use tempfile::TempDir;

    struct Display(Option<bool>);

    #[async_trait]
    impl ConnectivityProbe for Display {
        fn name(&self) -> &'static str {
            "test_display"
        }

        fn weight(&self) -> f64 {
            1.0
        }

        async fn probe(&self) -> io::Result<Option<bool>> {
            Ok(self.0)
        }
    }

    fn config(dir: &TempDir, stream_url: Option<&str>) -> AgentConfig {
        AgentConfig {
            stream_url: stream_url.map(str::to_string),
            state_dir: dir.path().to_path_buf(),
            force_marker_path: dir.path().join("force_provisioning"),
            timings: PlayerTimings::immediate(),
            ..Default::default()
        }
    }

    fn credentials() -> Credentials {
        Credentials { email: "ops@example.com".into(), password: "hunter2".into() }
    }

    fn agent(dir: &TempDir, config: AgentConfig, display: Option<bool>, page: Arc<FakePage>) -> Agent {
        let detector = ConnectivityDetector::with_probes(
            vec![Box::new(Display(display))],
            dir.path().join(HDMI_CACHE_FILE_NAME),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        let player = PlayerController::new(&config, Some(credentials())).with_page(page);
        Agent::new(config, Some(credentials()))
            .unwrap()
            .with_detector(detector)
            .with_player(player)
            .with_display_waits(Duration::ZERO, Duration::ZERO)
    }

    #[tokio::test]
    async fn missing_config_hands_over_to_provisioning() {
        let dir = TempDir::new().unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, None), Some(true), page.clone());

        let outcome = agent.boot().await.unwrap();
        assert_eq!(outcome.decision().reason, DecisionReason::MissingConfig);
        assert!(matches!(outcome, BootOutcome::Provision(_)));
        assert!(agent.provisioning().snapshot().current_session.is_some());
        assert!(page.navigations().is_empty());
    }

    #[tokio::test]
    async fn corrupt_config_file_still_reaches_provisioning() {
        let config_dir = TempDir::new().unwrap();
        let state_dir = TempDir::new().unwrap();
        std::fs::write(config_dir.path().join(CONFIG_FILE_NAME), "{bad").unwrap();
        std::fs::write(
            config_dir.path().join(CREDENTIALS_FILE_NAME),
            r#"{"email": "ops@example.com", "password": "hunter2"}"#,
        )
        .unwrap();

        let detector = ConnectivityDetector::with_probes(
            vec![Box::new(Display(Some(true)))],
            state_dir.path().join(HDMI_CACHE_FILE_NAME),
            Arc::new(ManualClock::new(1_700_000_000_000)),
        );
        let agent = Agent::from_config_dir(config_dir.path(), Some(state_dir.path()))
            .unwrap()
            .with_detector(detector)
            .with_display_waits(Duration::ZERO, Duration::ZERO);

        let (decision, _) = agent.decide().await;
        assert!(decision.should_provision);
        assert_eq!(decision.reason, DecisionReason::MissingConfig);
    }

    #[tokio::test]
    async fn ready_device_starts_the_stream() {
        let dir = TempDir::new().unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, Some("https://example.com/live/7")), Some(true), page.clone());

        let outcome = agent.boot().await.unwrap();
        assert_eq!(outcome, BootOutcome::Kiosk(outcome.decision().clone()));
        assert_eq!(outcome.decision().reason, DecisionReason::HdmiConnectedOrUnknown);
        assert_eq!(page.navigations(), vec!["https://example.com/live/7"]);
        assert!(page.playing.load(std::sync::atomic::Ordering::SeqCst));

        let response = agent.channel().handle_direct_method("pause", Value::Null).await;
        assert_eq!(response.status, crate::channel::STATUS_OK);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn disconnected_display_provisions_after_retry() {
        let dir = TempDir::new().unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, Some("https://example.com/live/7")), Some(false), page);

        let (decision, _) = agent.decide().await;
        assert!(decision.should_provision);
        assert_eq!(decision.reason, DecisionReason::HdmiDisconnectedTimeout);
        assert_eq!(agent.provisioning().statistics().total_triggers, 1);
    }

    #[tokio::test]
    async fn unknown_display_counts_as_connected() {
        let dir = TempDir::new().unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, Some("https://example.com/live/7")), None, page);

        let (decision, reading) = agent.decide().await;
        assert_eq!(reading.method, METHOD_ASSUME_CONNECTED);
        assert_eq!(decision.reason, DecisionReason::HdmiConnectedOrUnknown);
    }

    #[tokio::test]
    async fn headless_marker_skips_provisioning() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(HEADLESS_MARKER_FILE_NAME), "").unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, Some("https://example.com/live/7")), Some(false), page);

        let (decision, _) = agent.decide().await;
        assert!(!decision.should_provision);
        assert_eq!(decision.reason, DecisionReason::HeadlessOverride);
    }

    #[tokio::test]
    async fn repeated_boots_force_provisioning() {
        let dir = TempDir::new().unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, None), Some(true), page);

        for _ in 0..2 {
            assert_eq!(agent.boot().await.unwrap().decision().reason, DecisionReason::MissingConfig);
        }
        assert_eq!(agent.boot().await.unwrap().decision().reason, DecisionReason::ForceProvisioning);
        assert!(agent.markers().force_marker().exists());
    }

    #[tokio::test]
    async fn kiosk_boot_closes_open_session() {
        let dir = TempDir::new().unwrap();
        let page = Arc::new(FakePage::new(1920));
        let agent = agent(&dir, config(&dir, Some("https://example.com/live/7")), Some(true), page);
        agent.provisioning().record_session_start("prov-test", Metadata::new());

        agent.boot().await.unwrap();
        let stats = agent.provisioning().statistics();
        assert!(stats.current_session.is_none());
        assert_eq!(stats.successful_sessions, 1);
        agent.shutdown().await;
    }

    #[tokio::test]
    async fn status_command_reports_player_state() {
        let page = Arc::new(FakePage::new(1920));
        let config = AgentConfig { timings: PlayerTimings::immediate(), ..Default::default() };
        let player = Arc::new(PlayerController::new(&config, None).with_page(page));
        let handler = PlayerCommandHandler::new(player);

        let outcome = handler.handle(Command::Status, &Value::Null).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.data.as_ref().and_then(|d| d["launched"].as_bool()), Some(true));

        let outcome = handler.handle(Command::Restart, &Value::Null).await.unwrap();
        assert!(!outcome.success);
    }
}
