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

mod cli;
mod logger;

use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use log::{debug, error, info, warn};
use serde::Serialize;

use kiosk_core::agent::{Agent, BootOutcome};

use cli::{Cli, Commands, HeadlessCommands, StateCommands};

/// Exit status telling the supervisor to start the provisioning service instead.
const EXIT_PROVISION: u8 = 2;
const EXIT_BOOT_LOOP: u8 = 1;

async fn shutdown_signal() {
    debug!("Press Ctrl+C to exit");

    #[cfg(unix)]
    {
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C signal, exiting..."),
            _ = terminate.recv() => info!("Received SIGTERM, exiting..."),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C signal, exiting...");
    }
}

fn build_agent(cli: &Cli) -> anyhow::Result<Agent> {
    Agent::from_config_dir(&cli.config_dir, cli.state_dir.as_deref())
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_command(cli: Cli) -> anyhow::Result<ExitCode> {
    let agent = build_agent(&cli)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!("Starting kiosk agent {}", env!("CARGO_PKG_VERSION"));
            match agent.run(shutdown_signal()).await? {
                BootOutcome::Provision(decision) => {
                    info!("Provisioning required ({})", decision.reason);
                    Ok(ExitCode::from(EXIT_PROVISION))
                }
                BootOutcome::Kiosk(_) => Ok(ExitCode::SUCCESS),
            }
        }
        Commands::Decide => {
            let (decision, reading) = agent.decide().await;
            print_json(&serde_json::json!({ "decision": decision, "display": reading }))?;
            Ok(if decision.should_provision { ExitCode::from(EXIT_PROVISION) } else { ExitCode::SUCCESS })
        }
        Commands::Hdmi => {
            let diagnostics = agent.detector().diagnostics(agent.markers().headless_override()).await;
            print_json(&diagnostics)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command: StateCommands::Show } => {
            let provisioning = agent.provisioning();
            print_json(&serde_json::json!({
                "statistics": provisioning.statistics(),
                "recovery": provisioning.check_recovery(),
                "state": provisioning.snapshot(),
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::State { command: StateCommands::Clear } => {
            agent.provisioning().clear();
            info!("Provisioning state cleared");
            Ok(ExitCode::SUCCESS)
        }
        Commands::Headless { command } => {
            let result = match command {
                HeadlessCommands::Enable => agent.markers().enable_headless(),
                HeadlessCommands::Disable => agent.markers().disable_headless(),
            };
            result.context("Failed to update headless marker")?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::BootCheck { clear: true } => {
            agent.boot_loop().clear().context("Failed to clear boot history")?;
            info!("Boot history cleared");
            Ok(ExitCode::SUCCESS)
        }
        Commands::BootCheck { clear: false } => {
            let report = agent.boot_loop().record_boot();
            print_json(&report)?;
            Ok(if report.loop_detected { ExitCode::from(EXIT_BOOT_LOOP) } else { ExitCode::SUCCESS })
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logger::init_logger(cli.log_level, cli.log_file.as_deref()) {
        eprintln!("Failed to initialize logger: {}", e);
    }

    match run_command(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
