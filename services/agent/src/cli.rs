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

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn to_level_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Set the log level
    #[arg(short, long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Write logs to this file instead of the console
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Directory holding config.json and credentials.json
    #[arg(short, long, default_value = "/etc/kiosk-agent")]
    pub config_dir: PathBuf,

    /// Overrides the state directory from the config file
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Boot the agent and keep it running (default)
    Run,

    /// Print the provisioning decision for the current conditions
    Decide,

    /// Print display detection diagnostics
    Hdmi,

    /// Inspect or reset provisioning history
    State {
        #[command(subcommand)]
        command: StateCommands,
    },

    /// Toggle the headless override marker
    Headless {
        #[command(subcommand)]
        command: HeadlessCommands,
    },

    /// Record a boot and exit with 1 when the device is boot looping
    BootCheck {
        /// Forget boot history and remove the force-provisioning marker
        #[arg(long)]
        clear: bool,
    },
}

#[derive(Subcommand)]
pub enum StateCommands {
    Show,
    Clear,
}

#[derive(Subcommand)]
pub enum HeadlessCommands {
    Enable,
    Disable,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_is_the_default_command() {
        let cli = Cli::parse_from(["kiosk_agent"]);
        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.config_dir, PathBuf::from("/etc/kiosk-agent"));
    }

    #[test]
    fn nested_commands_parse() {
        let cli = Cli::parse_from(["kiosk_agent", "-l", "debug", "boot-check", "--clear"]);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(matches!(cli.command, Some(Commands::BootCheck { clear: true })));

        let cli = Cli::parse_from(["kiosk_agent", "headless", "enable"]);
        assert!(matches!(cli.command, Some(Commands::Headless { command: HeadlessCommands::Enable })));
    }
}
