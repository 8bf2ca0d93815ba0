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

//! In-memory page standing in for the browser in tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::coordinates::{self, ClickAction};
use super::page::PageDriver;
use super::{scripts, PlayerError};

pub const SUBMIT_CENTER: (i64, i64) = (640, 400);

/// A player page whose video toggles when its play control is clicked, optionally behind a login form.
pub struct FakePage {
    width: u32,
    play_point: (i64, i64),
    pub login_page: AtomicBool,
    pub accepts_login: AtomicBool,
    pub submit_visible: AtomicBool,
    pub has_video: AtomicBool,
    pub playing: AtomicBool,
    pub overlays: AtomicUsize,
    pub enter_presses: AtomicUsize,
    clicks: Mutex<Vec<(i64, i64)>>,
    navigations: Mutex<Vec<String>>,
    typed: Mutex<Vec<String>>,
}

impl FakePage {
    pub fn new(width: u32) -> Self {
        let play = coordinates::resolve(&coordinates::default_table(), ClickAction::Play, width)
            .map(|p| (p.x, p.y))
            .unwrap_or_default();
        Self {
            width,
            play_point: play,
            login_page: AtomicBool::new(false),
            accepts_login: AtomicBool::new(true),
            submit_visible: AtomicBool::new(false),
            has_video: AtomicBool::new(true),
            playing: AtomicBool::new(false),
            overlays: AtomicUsize::new(0),
            enter_presses: AtomicUsize::new(0),
            clicks: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            typed: Mutex::new(Vec::new()),
        }
    }

    pub fn clicks(&self) -> Vec<(i64, i64)> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().unwrap().clone()
    }

    pub fn typed(&self) -> Vec<String> {
        self.typed.lock().unwrap().clone()
    }

    fn submit_login(&self) {
        if self.accepts_login.load(Ordering::SeqCst) {
            self.login_page.store(false, Ordering::SeqCst);
        }
    }

    fn video_state(&self) -> Value {
        if !self.has_video.load(Ordering::SeqCst) {
            return Value::Null;
        }
        if self.playing.load(Ordering::SeqCst) {
            json!({"paused": false, "ended": false, "readyState": 4, "currentTime": 1.5})
        } else {
            json!({"paused": true, "ended": false, "readyState": 4, "currentTime": 0.0})
        }
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str, _timeout: Duration) -> Result<(), PlayerError> {
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> Result<Value, PlayerError> {
        let login = self.login_page.load(Ordering::SeqCst);
        let value = match script {
            scripts::IS_LOGIN_PAGE | scripts::HAS_LOGIN_FORM | scripts::STILL_ON_LOGIN => json!(login),
            scripts::ACCEPT_COOKIES | scripts::SUBMIT_FORM => json!(false),
            scripts::PLAYER_SURFACE_PRESENT | scripts::PLAYER_READY => json!(self.has_video.load(Ordering::SeqCst)),
            scripts::VIDEO_STATE => self.video_state(),
            scripts::VIEWPORT_WIDTH => json!(self.width),
            s if s.contains("createElement") => {
                self.overlays.fetch_add(1, Ordering::SeqCst);
                json!(true)
            }
            s if s.contains("el.focus()") && login => json!("matched"),
            s if s.contains("getBoundingClientRect") && login && self.submit_visible.load(Ordering::SeqCst) => {
                json!({"x": SUBMIT_CENTER.0, "y": SUBMIT_CENTER.1})
            }
            _ => Value::Null,
        };
        Ok(value)
    }

    async fn move_mouse(&self, _x: i64, _y: i64) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn click(&self, x: i64, y: i64) -> Result<(), PlayerError> {
        self.clicks.lock().unwrap().push((x, y));
        if (x, y) == self.play_point && self.has_video.load(Ordering::SeqCst) {
            self.playing.fetch_xor(true, Ordering::SeqCst);
        }
        if (x, y) == SUBMIT_CENTER {
            self.submit_login();
        }
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), PlayerError> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), PlayerError> {
        self.enter_presses.fetch_add(1, Ordering::SeqCst);
        self.submit_login();
        Ok(())
    }

    async fn wait_for_navigation(&self, _timeout: Duration) -> Result<bool, PlayerError> {
        Ok(!self.login_page.load(Ordering::SeqCst))
    }

    async fn url(&self) -> Result<String, PlayerError> {
        Ok(self.navigations().last().cloned().unwrap_or_default())
    }

    async fn close(&self) -> Result<(), PlayerError> {
        Ok(())
    }
}
