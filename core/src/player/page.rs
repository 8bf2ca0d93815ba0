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

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::PlayerError;

/// The browser page the player automates.
///
/// Input is emulated at the device level (mouse and keyboard events), the page itself is only
/// inspected through scripts.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Loads `url` and waits for the load event.
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PlayerError>;

    /// Evaluates a JavaScript expression and returns its JSON value (`Null` for `undefined`).
    async fn evaluate(&self, script: &str) -> Result<Value, PlayerError>;

    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), PlayerError>;

    /// Left click at viewport coordinates.
    async fn click(&self, x: i64, y: i64) -> Result<(), PlayerError>;

    /// Types into the focused element.
    async fn insert_text(&self, text: &str) -> Result<(), PlayerError>;

    async fn press_enter(&self) -> Result<(), PlayerError>;

    /// `true` if the page navigated within `timeout`.
    async fn wait_for_navigation(&self, timeout: Duration) -> Result<bool, PlayerError>;

    async fn url(&self) -> Result<String, PlayerError>;

    async fn close(&self) -> Result<(), PlayerError>;
}
