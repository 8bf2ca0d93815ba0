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

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Play,
    Pause,
    Fullscreen,
    Restart,
    Status,
}

impl Command {
    pub const ALL: [Command; 5] = [Command::Play, Command::Pause, Command::Fullscreen, Command::Restart, Command::Status];

    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Play => "play",
            Command::Pause => "pause",
            Command::Fullscreen => "fullscreen",
            Command::Restart => "restart",
            Command::Status => "status",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown command: {}", self.0)
    }
}

impl std::error::Error for UnknownCommand {}

impl FromStr for Command {
    type Err = UnknownCommand;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        Command::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| UnknownCommand(name.to_string()))
    }
}

/// What a handler reports back for one command.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl CommandOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self { success: true, message: Some(message.into()), ..Default::default() }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { success: false, error: Some(error.into()), ..Default::default() }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// The single receiver of remote commands, whichever transport they arrive on.
///
/// `Ok` with `success == false` is a rejection; `Err` is an execution failure.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, command: Command, payload: &Value) -> anyhow::Result<CommandOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("play".parse::<Command>(), Ok(Command::Play));
        assert_eq!(" FullScreen ".parse::<Command>(), Ok(Command::Fullscreen));
        assert_eq!("reboot".parse::<Command>(), Err(UnknownCommand("reboot".into())));
    }

    #[test]
    fn outcome_serializes_without_empty_fields() {
        let json = CommandOutcome::ok("Playing").to_json();
        assert_eq!(json, serde_json::json!({"success": true, "message": "Playing"}));

        let json = CommandOutcome::failed("no video").with_data(serde_json::json!({"phase": "loaded"})).to_json();
        assert_eq!(json["error"], "no video");
        assert_eq!(json["data"]["phase"], "loaded");
    }
}
