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

pub mod agent;
pub mod channel;
pub mod clock;
pub mod config;
pub mod detector;
pub mod player;
pub mod provisioning;
pub mod service;

pub use agent::{Agent, BootOutcome, PlayerCommandHandler};
pub use channel::{Command, CommandChannel, CommandHandler, CommandOutcome};
pub use config::{AgentConfig, Credentials};
pub use detector::{ConnectivityDetector, ConnectivityReading};
pub use player::{ControlOutcome, PlayerController, PlayerError};
pub use provisioning::{DecisionConditions, DecisionReason, ProvisioningDecision, ProvisioningStateMachine};
