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

//! Browser-hosted stream player.
//!
//! The player page has no API of its own, so playback is controlled by clicking its on-screen
//! controls. Clicks are guarded by checks of the `<video>` element so that `play` and `pause`
//! only click when the state actually has to change. All operations are serialized by one lock.

pub mod browser;
pub mod cdp;
pub mod coordinates;
pub mod login;
pub mod page;
pub mod scripts;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{sleep, Instant};

use crate::config::{AgentConfig, BrowserConfig, Credentials, LoginConfig};
use browser::BrowserProcess;
use cdp::{CdpError, CdpPage, CdpSession};
use coordinates::{ClickAction, CoordinateTable};
pub use login::LoginOutcome;
pub use page::PageDriver;

const CDP_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum PlayerError {
    #[error("No browser executable found (checked {0})")]
    BrowserNotFound(String),

    #[error("Failed to start browser: {0}")]
    Launch(#[source] std::io::Error),

    #[error("Browser exited early: {0}")]
    Exited(String),

    #[error("Browser did not expose a page within {0:?}")]
    NoPage(Duration),

    #[error(transparent)]
    Cdp(#[from] CdpError),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Page script failed: {0}")]
    Script(String),

    #[error("No click coordinates configured")]
    NoCoordinates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerPhase {
    Idle,
    Launching,
    Loaded,
    LoginRequired,
    Authenticating,
    Playing,
    Paused,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotLaunched,
    NoStream,
    LoginRequired,
}

/// Result of a playback control. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    /// Clicked and the page confirmed the new state.
    Confirmed,
    /// The desired state already held, nothing was clicked.
    AlreadyInState,
    /// Clicked, but the page did not (yet) show the new state.
    Unconfirmed,
    Skipped(SkipReason),
    Failed(String),
}

impl ControlOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ControlOutcome::Confirmed | ControlOutcome::AlreadyInState | ControlOutcome::Unconfirmed)
    }
}

impl fmt::Display for ControlOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlOutcome::Confirmed => f.write_str("done"),
            ControlOutcome::AlreadyInState => f.write_str("already in requested state"),
            ControlOutcome::Unconfirmed => f.write_str("clicked, state not confirmed yet"),
            ControlOutcome::Skipped(SkipReason::NotLaunched) => f.write_str("browser is not running"),
            ControlOutcome::Skipped(SkipReason::NoStream) => f.write_str("no stream loaded"),
            ControlOutcome::Skipped(SkipReason::LoginRequired) => f.write_str("page is asking for a login"),
            ControlOutcome::Failed(e) => write!(f, "failed: {e}"),
        }
    }
}

/// Waits and retry budgets of the page automation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PlayerTimings {
    pub login_poll_attempts: u32,
    pub login_poll_interval_ms: u64,
    pub login_navigation_timeout_ms: u64,
    pub login_settle_ms: u64,
    pub consent_settle_ms: u64,
    pub post_fill_settle_ms: u64,
    pub submit_attempts: u32,
    pub submit_first_wait_ms: u64,
    pub submit_retry_wait_ms: u64,
    pub submit_backoff_ms: u64,
    pub post_submit_wait_ms: u64,
    pub surface_wait_ms: u64,
    pub ready_wait_ms: u64,
    pub stabilize_ms: u64,
    pub click_hover_ms: u64,
    pub post_play_check_ms: u64,
    pub post_pause_check_ms: u64,
    pub fullscreen_surface_wait_ms: u64,
    pub fullscreen_delay_ms: u64,
}

impl Default for PlayerTimings {
    fn default() -> Self {
        Self {
            login_poll_attempts: 10,
            login_poll_interval_ms: 500,
            login_navigation_timeout_ms: 20_000,
            login_settle_ms: 2_000,
            consent_settle_ms: 500,
            post_fill_settle_ms: 1_000,
            submit_attempts: 3,
            submit_first_wait_ms: 5_000,
            submit_retry_wait_ms: 2_000,
            submit_backoff_ms: 1_000,
            post_submit_wait_ms: 8_000,
            surface_wait_ms: 5_000,
            ready_wait_ms: 8_000,
            stabilize_ms: 1_000,
            click_hover_ms: 250,
            post_play_check_ms: 2_000,
            post_pause_check_ms: 1_000,
            fullscreen_surface_wait_ms: 3_000,
            fullscreen_delay_ms: 500,
        }
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

impl PlayerTimings {
    /// Same budgets without any waiting.
    pub fn immediate() -> Self {
        Self {
            login_poll_interval_ms: 0,
            login_navigation_timeout_ms: 0,
            login_settle_ms: 0,
            consent_settle_ms: 0,
            post_fill_settle_ms: 0,
            submit_first_wait_ms: 0,
            submit_retry_wait_ms: 0,
            submit_backoff_ms: 0,
            post_submit_wait_ms: 0,
            surface_wait_ms: 0,
            ready_wait_ms: 0,
            stabilize_ms: 0,
            click_hover_ms: 0,
            post_play_check_ms: 0,
            post_pause_check_ms: 0,
            fullscreen_surface_wait_ms: 0,
            fullscreen_delay_ms: 0,
            ..Self::default()
        }
    }

    pub fn login_navigation_timeout(&self) -> Duration {
        ms(self.login_navigation_timeout_ms)
    }
    pub fn login_settle(&self) -> Duration {
        ms(self.login_settle_ms)
    }
    pub fn consent_settle(&self) -> Duration {
        ms(self.consent_settle_ms)
    }
    pub fn post_fill_settle(&self) -> Duration {
        ms(self.post_fill_settle_ms)
    }
    pub fn submit_first_wait(&self) -> Duration {
        ms(self.submit_first_wait_ms)
    }
    pub fn submit_retry_wait(&self) -> Duration {
        ms(self.submit_retry_wait_ms)
    }
    pub fn submit_backoff(&self) -> Duration {
        ms(self.submit_backoff_ms)
    }
    pub fn post_submit_wait(&self) -> Duration {
        ms(self.post_submit_wait_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatus {
    pub phase: PlayerPhase,
    pub launched: bool,
    pub stream_url: Option<String>,
    pub video_playing: bool,
}

#[derive(Default)]
struct Session {
    page: Option<Arc<dyn PageDriver>>,
    browser: Option<BrowserProcess>,
    stream_url: Option<String>,
}

pub struct PlayerController {
    browser_config: BrowserConfig,
    login: LoginConfig,
    credentials: Option<Credentials>,
    coordinates: CoordinateTable,
    timings: PlayerTimings,
    show_click_overlay: bool,
    phase: std::sync::Mutex<PlayerPhase>,
    session: tokio::sync::Mutex<Session>,
}

impl PlayerController {
    pub fn new(config: &AgentConfig, credentials: Option<Credentials>) -> Self {
        let coordinates = config
            .coordinates
            .clone()
            .filter(|table| !table.is_empty())
            .unwrap_or_else(coordinates::default_table);
        Self {
            browser_config: config.browser.clone(),
            login: config.login.clone(),
            credentials,
            coordinates,
            timings: config.timings.clone(),
            show_click_overlay: config.show_click_overlay,
            phase: std::sync::Mutex::new(PlayerPhase::Idle),
            session: tokio::sync::Mutex::new(Session::default()),
        }
    }

    /// Drives an already open page instead of launching a browser.
    pub fn with_page(mut self, page: Arc<dyn PageDriver>) -> Self {
        self.session.get_mut().page = Some(page);
        self.set_phase(PlayerPhase::Loaded);
        self
    }

    pub fn phase(&self) -> PlayerPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: PlayerPhase) {
        let mut current = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *current != phase {
            debug!("Player phase {:?} -> {:?}", *current, phase);
            *current = phase;
        }
    }

    /// Starts the browser and attaches to its first page. The only player operation that can fail.
    pub async fn launch(&self) -> Result<(), PlayerError> {
        let mut session = self.session.lock().await;
        if session.page.is_some() {
            debug!("Browser already running");
            return Ok(());
        }
        self.set_phase(PlayerPhase::Launching);
        match self.start_browser().await {
            Ok((browser, page)) => {
                session.browser = Some(browser);
                session.page = Some(page);
                self.set_phase(PlayerPhase::Loaded);
                info!("Browser launched");
                Ok(())
            }
            Err(e) => {
                self.set_phase(PlayerPhase::Idle);
                Err(e)
            }
        }
    }

    async fn start_browser(&self) -> Result<(BrowserProcess, Arc<dyn PageDriver>), PlayerError> {
        let mut browser = BrowserProcess::launch(&self.browser_config).await?;
        let attached = async {
            let ws_url = browser
                .page_websocket_url(ms(self.browser_config.launch_timeout_ms))
                .await?;
            let session = CdpSession::connect(&ws_url, CDP_CALL_TIMEOUT).await?;
            let mut page = CdpPage::attach(session).await?;
            page.handle_dialogs(self.credentials.as_ref().map(|c| c.password.clone()));
            Ok::<_, PlayerError>(page)
        }
        .await;

        match attached {
            Ok(page) => Ok((browser, Arc::new(page))),
            Err(e) => {
                browser.kill().await;
                Err(e)
            }
        }
    }

    /// Opens the stream, signs in when the page asks for it, then starts playback in fullscreen.
    pub async fn go_to_stream(&self, url: &str) -> ControlOutcome {
        let mut session = self.session.lock().await;
        let Some(page) = session.page.clone() else {
            warn!("Cannot open stream, browser is not running");
            return ControlOutcome::Skipped(SkipReason::NotLaunched);
        };
        session.stream_url = Some(url.to_string());
        self.load_stream(page.as_ref(), url).await
    }

    /// Loads the current stream again.
    pub async fn reload(&self) -> ControlOutcome {
        let session = self.session.lock().await;
        let (Some(page), Some(url)) = (session.page.clone(), session.stream_url.clone()) else {
            return ControlOutcome::Skipped(if session.page.is_none() {
                SkipReason::NotLaunched
            } else {
                SkipReason::NoStream
            });
        };
        self.load_stream(page.as_ref(), &url).await
    }

    async fn load_stream(&self, page: &dyn PageDriver, url: &str) -> ControlOutcome {
        let navigation_timeout = ms(self.browser_config.navigation_timeout_ms);
        info!("Opening stream {}", url);
        if let Err(e) = page.navigate(url, navigation_timeout).await {
            warn!("Loading {} did not complete: {}", url, e);
        }

        if self.poll_for_login(page).await {
            self.set_phase(PlayerPhase::LoginRequired);
            info!("Stream asks for a login, authenticating");
            self.set_phase(PlayerPhase::Authenticating);
            let outcome = login::log_in(page, self.credentials.as_ref(), &self.login, &self.timings).await;
            debug!("Login finished: {:?}", outcome);
            info!("Returning to stream {}", url);
            if let Err(e) = page.navigate(url, navigation_timeout).await {
                warn!("Loading {} did not complete: {}", url, e);
            }
        }
        self.set_phase(PlayerPhase::Loaded);

        let outcome = self.play_on(page).await;
        sleep(ms(self.timings.fullscreen_delay_ms)).await;
        self.fullscreen_on(page).await;
        outcome
    }

    /// Login forms are often rendered late, so the check is repeated for a while.
    async fn poll_for_login(&self, page: &dyn PageDriver) -> bool {
        let attempts = self.timings.login_poll_attempts.max(1);
        for attempt in 1..=attempts {
            if login::is_login_page(page).await {
                return true;
            }
            if attempt < attempts {
                sleep(ms(self.timings.login_poll_interval_ms)).await;
            }
        }
        false
    }

    pub async fn play(&self) -> ControlOutcome {
        let session = self.session.lock().await;
        match session.page.clone() {
            Some(page) => self.play_on(page.as_ref()).await,
            None => ControlOutcome::Skipped(SkipReason::NotLaunched),
        }
    }

    pub async fn pause(&self) -> ControlOutcome {
        let session = self.session.lock().await;
        match session.page.clone() {
            Some(page) => self.pause_on(page.as_ref()).await,
            None => ControlOutcome::Skipped(SkipReason::NotLaunched),
        }
    }

    pub async fn fullscreen(&self) -> ControlOutcome {
        let session = self.session.lock().await;
        match session.page.clone() {
            Some(page) => self.fullscreen_on(page.as_ref()).await,
            None => ControlOutcome::Skipped(SkipReason::NotLaunched),
        }
    }

    async fn play_on(&self, page: &dyn PageDriver) -> ControlOutcome {
        info!("Starting playback");
        if login::is_login_page(page).await {
            self.set_phase(PlayerPhase::LoginRequired);
            return ControlOutcome::Skipped(SkipReason::LoginRequired);
        }
        wait_until(page, scripts::PLAYER_SURFACE_PRESENT, ms(self.timings.surface_wait_ms), ms(200)).await;
        if video_playing(page).await {
            info!("Video already playing");
            self.set_phase(PlayerPhase::Playing);
            return ControlOutcome::AlreadyInState;
        }

        wait_until(page, scripts::PLAYER_READY, ms(self.timings.ready_wait_ms), ms(500)).await;
        sleep(ms(self.timings.stabilize_ms)).await;
        if let Err(e) = self.click_control(page, ClickAction::Play).await {
            error!("Failed to click play: {}", e);
            return ControlOutcome::Failed(e.to_string());
        }

        sleep(ms(self.timings.post_play_check_ms)).await;
        if video_playing(page).await {
            info!("Playback started");
            self.set_phase(PlayerPhase::Playing);
            ControlOutcome::Confirmed
        } else {
            warn!("Play was clicked but the video is not playing yet");
            ControlOutcome::Unconfirmed
        }
    }

    async fn pause_on(&self, page: &dyn PageDriver) -> ControlOutcome {
        info!("Pausing playback");
        if login::is_login_page(page).await {
            self.set_phase(PlayerPhase::LoginRequired);
            return ControlOutcome::Skipped(SkipReason::LoginRequired);
        }
        if !video_playing(page).await {
            info!("Video already paused");
            self.set_phase(PlayerPhase::Paused);
            return ControlOutcome::AlreadyInState;
        }

        if let Err(e) = self.click_control(page, ClickAction::Play).await {
            error!("Failed to click pause: {}", e);
            return ControlOutcome::Failed(e.to_string());
        }

        sleep(ms(self.timings.post_pause_check_ms)).await;
        if video_playing(page).await {
            warn!("Pause was clicked but the video is still playing");
            ControlOutcome::Unconfirmed
        } else {
            self.set_phase(PlayerPhase::Paused);
            ControlOutcome::Confirmed
        }
    }

    /// Fullscreen state cannot be read back reliably, so this always clicks.
    async fn fullscreen_on(&self, page: &dyn PageDriver) -> ControlOutcome {
        info!("Entering fullscreen");
        if login::is_login_page(page).await {
            return ControlOutcome::Skipped(SkipReason::LoginRequired);
        }
        wait_until(page, scripts::PLAYER_SURFACE_PRESENT, ms(self.timings.fullscreen_surface_wait_ms), ms(200)).await;
        match self.click_control(page, ClickAction::Fullscreen).await {
            Ok(()) => ControlOutcome::Unconfirmed,
            Err(e) => {
                error!("Failed to click fullscreen: {}", e);
                ControlOutcome::Failed(e.to_string())
            }
        }
    }

    async fn click_control(&self, page: &dyn PageDriver, action: ClickAction) -> Result<(), PlayerError> {
        let width = page.evaluate(scripts::VIEWPORT_WIDTH).await?.as_f64().unwrap_or_default() as u32;
        let point = coordinates::resolve(&self.coordinates, action, width).ok_or(PlayerError::NoCoordinates)?;
        debug!("Clicking {} at ({}, {}) for width {}", action, point.x, point.y, width);

        page.move_mouse(point.x, point.y).await?;
        if self.show_click_overlay {
            if let Err(e) = page.evaluate(&scripts::click_overlay(point.x, point.y, &action.to_string())).await {
                debug!("Click overlay failed: {}", e);
            }
        }
        sleep(ms(self.timings.click_hover_ms)).await;
        page.click(point.x, point.y).await
    }

    pub async fn status(&self) -> PlayerStatus {
        let session = self.session.lock().await;
        let video_playing = match &session.page {
            Some(page) => video_playing(page.as_ref()).await,
            None => false,
        };
        PlayerStatus {
            phase: self.phase(),
            launched: session.page.is_some(),
            stream_url: session.stream_url.clone(),
            video_playing,
        }
    }

    pub async fn close(&self) {
        let mut session = self.session.lock().await;
        if let Some(page) = session.page.take() {
            if let Err(e) = page.close().await {
                debug!("Closing page failed: {}", e);
            }
        }
        if let Some(mut browser) = session.browser.take() {
            browser.kill().await;
        }
        self.set_phase(PlayerPhase::Closed);
    }
}

async fn video_playing(page: &dyn PageDriver) -> bool {
    match page.evaluate(scripts::VIDEO_STATE).await {
        Ok(serde_json::Value::Null) => false,
        Ok(value) => serde_json::from_value::<scripts::VideoState>(value)
            .map(|state| state.is_playing())
            .unwrap_or(false),
        Err(e) => {
            debug!("Video state check failed: {}", e);
            false
        }
    }
}

/// Polls a boolean page script until it holds or `timeout` passes.
async fn wait_until(page: &dyn PageDriver, script: &str, timeout: Duration, interval: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if page.evaluate(script).await.ok().and_then(|v| v.as_bool()) == Some(true) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(interval).await;
    }
}
