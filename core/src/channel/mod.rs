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

//! Remote control of the device.
//!
//! Commands arrive on two transports: a request/response method server on a local IPC endpoint
//! (fed by the hub bridge) and a queued at-least-once mailbox polled from the hub. Both end up in
//! the one registered [`CommandHandler`]. Every command is written to a bounded audit history
//! before the handler runs.

pub mod command;
pub mod hub;
pub mod method_server;

use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::config::ChannelConfig;
use crate::service::{spawn_service, MultiServiceHandle};
pub use command::{Command, CommandHandler, CommandOutcome, UnknownCommand};
use hub::HubClient;
use method_server::MethodServer;

pub const COMMAND_HISTORY_CAPACITY: usize = 50;

pub const STATUS_OK: u16 = 200;
pub const STATUS_REJECTED: u16 = 400;
pub const STATUS_FAILED: u16 = 500;
pub const STATUS_NO_HANDLER: u16 = 501;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("A command handler is already registered")]
    HandlerAlreadyRegistered,

    #[error("IPC endpoint error: {0}")]
    Endpoint(String),

    #[error("Hub request failed: {0}")]
    Hub(#[from] reqwest::Error),

    #[error("Hub responded with status {0}")]
    HubStatus(u16),

    #[error("No hub is configured")]
    NoHub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Primary,
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRecord {
    pub timestamp_ms: u64,
    pub command: String,
    pub payload: Value,
    pub source: CommandSource,
}

/// Reply to a primary-transport invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodResponse {
    pub status: u16,
    pub body: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStatus {
    pub connected: bool,
    pub primary_connected: bool,
    pub fallback_connected: bool,
    pub device_id: String,
    pub last_command: Option<CommandRecord>,
}

/// A message taken from the queued transport, locked until completed or rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub lock_token: String,
    pub body: String,
}

#[async_trait]
pub trait MessageAcknowledger: Send + Sync {
    async fn complete(&self, message: &InboundMessage) -> Result<(), ChannelError>;
    async fn reject(&self, message: &InboundMessage) -> Result<(), ChannelError>;
}

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    async fn send(&self, event: Value) -> Result<(), ChannelError>;
}

#[derive(Deserialize)]
struct QueuedCommand {
    command: String,
    #[serde(default)]
    payload: Value,
}

/// `{command, payload}` JSON, or the whole body as the command name when it is not.
fn parse_queued_body(body: &str) -> (String, Value) {
    match serde_json::from_str::<QueuedCommand>(body) {
        Ok(parsed) => (parsed.command, parsed.payload),
        Err(_) => (body.to_string(), Value::Null),
    }
}

enum DispatchFailure {
    NoHandler,
    Unknown(UnknownCommand),
    Handler(anyhow::Error),
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

pub struct CommandChannel {
    device_id: String,
    config: ChannelConfig,
    clock: Arc<dyn Clock>,
    handler: OnceLock<Arc<dyn CommandHandler>>,
    history: Mutex<VecDeque<CommandRecord>>,
    primary_connected: AtomicBool,
    fallback_connected: AtomicBool,
    hub: Option<Arc<HubClient>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
    services: tokio::sync::Mutex<Option<MultiServiceHandle>>,
}

impl CommandChannel {
    pub fn new(device_id: impl Into<String>, config: ChannelConfig) -> Result<Self, ChannelError> {
        let device_id = device_id.into();
        let hub = match config.hub_url.as_deref() {
            Some(url) if !url.trim().is_empty() => Some(Arc::new(HubClient::new(url, &device_id, &config)?)),
            _ => None,
        };
        let telemetry = hub.clone().map(|h| h as Arc<dyn TelemetrySink>);
        Ok(Self {
            device_id,
            config,
            clock: Arc::new(SystemClock),
            handler: OnceLock::new(),
            history: Mutex::new(VecDeque::with_capacity(COMMAND_HISTORY_CAPACITY)),
            primary_connected: AtomicBool::new(false),
            fallback_connected: AtomicBool::new(false),
            hub,
            telemetry,
            services: tokio::sync::Mutex::new(None),
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Installs the command handler. Only the first registration is accepted.
    pub fn register_handler(&self, handler: Arc<dyn CommandHandler>) -> Result<(), ChannelError> {
        self.handler.set(handler).map_err(|_| ChannelError::HandlerAlreadyRegistered)
    }

    fn record(&self, command: &str, payload: &Value, source: CommandSource) {
        let record = CommandRecord {
            timestamp_ms: self.clock.now_ms(),
            command: command.to_string(),
            payload: payload.clone(),
            source,
        };
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        history.push_front(record);
        history.truncate(COMMAND_HISTORY_CAPACITY);
    }

    /// Newest first.
    pub fn history(&self) -> Vec<CommandRecord> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner).iter().cloned().collect()
    }

    async fn dispatch(&self, name: &str, payload: &Value, source: CommandSource) -> Result<CommandOutcome, DispatchFailure> {
        self.record(name, payload, source);
        let handler = self.handler.get().ok_or(DispatchFailure::NoHandler)?;
        let command = name.parse::<Command>().map_err(DispatchFailure::Unknown)?;
        info!("Executing {} command from {:?} transport", command, source);
        match AssertUnwindSafe(handler.handle(command, payload)).catch_unwind().await {
            Ok(result) => result.map_err(DispatchFailure::Handler),
            Err(panic) => Err(DispatchFailure::Handler(anyhow::anyhow!(
                "{} handler panicked: {}",
                command,
                panic_message(panic.as_ref())
            ))),
        }
    }

    /// Primary transport entry point.
    pub async fn handle_direct_method(&self, method: &str, payload: Value) -> MethodResponse {
        let response = match self.dispatch(method, &payload, CommandSource::Primary).await {
            Ok(outcome) => MethodResponse {
                status: if outcome.success { STATUS_OK } else { STATUS_REJECTED },
                body: outcome.to_json(),
            },
            Err(DispatchFailure::Unknown(unknown)) => MethodResponse {
                status: STATUS_REJECTED,
                body: CommandOutcome::failed(unknown.to_string()).to_json(),
            },
            Err(DispatchFailure::Handler(e)) => {
                error!("Command {} failed: {:#}", method, e);
                MethodResponse { status: STATUS_FAILED, body: CommandOutcome::failed(format!("{e:#}")).to_json() }
            }
            Err(DispatchFailure::NoHandler) => MethodResponse {
                status: STATUS_NO_HANDLER,
                body: CommandOutcome::failed("No command handler registered").to_json(),
            },
        };
        debug!("Method {} answered with {}", method, response.status);
        self.report_command(method, CommandSource::Primary, response.status == STATUS_OK).await;
        response
    }

    /// Fallback transport entry point. The message is always completed or rejected.
    pub async fn handle_queued_message(&self, message: &InboundMessage, acknowledger: &dyn MessageAcknowledger) -> CommandOutcome {
        let (name, payload) = parse_queued_body(&message.body);
        let outcome = match self.dispatch(&name, &payload, CommandSource::Fallback).await {
            Ok(outcome) => outcome,
            Err(DispatchFailure::Unknown(unknown)) => CommandOutcome::failed(unknown.to_string()),
            Err(DispatchFailure::Handler(e)) => {
                error!("Queued command {} failed: {:#}", name, e);
                CommandOutcome::failed(format!("{e:#}"))
            }
            Err(DispatchFailure::NoHandler) => {
                warn!("Queued command {} arrived before a handler was registered", name);
                CommandOutcome::failed("No command handler registered")
            }
        };

        if let Err(e) = acknowledger.complete(message).await {
            warn!("Failed to complete queued message, rejecting it: {}", e);
            if let Err(e) = acknowledger.reject(message).await {
                error!("Failed to reject queued message: {}", e);
            }
        }
        self.report_command(&name, CommandSource::Fallback, outcome.success).await;
        outcome
    }

    async fn report_command(&self, command: &str, source: CommandSource, success: bool) {
        if self.telemetry.is_some() {
            self.send_telemetry(json!({
                "event": "command",
                "command": command,
                "source": source,
                "success": success,
            }))
            .await;
        }
    }

    /// Best effort. Returns whether the event was delivered.
    pub async fn send_telemetry(&self, data: Value) -> bool {
        let Some(sink) = &self.telemetry else {
            debug!("Telemetry dropped, no hub configured");
            return false;
        };
        let mut event = json!({
            "deviceId": self.device_id,
            "timestamp": self.clock.now_ms(),
        });
        match (event.as_object_mut(), data) {
            (Some(target), Value::Object(fields)) => target.extend(fields),
            (Some(_), Value::Null) => {}
            (Some(target), other) => {
                target.insert("data".to_string(), other);
            }
            (None, _) => {}
        }
        match sink.send(event).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send telemetry: {}", e);
                false
            }
        }
    }

    pub fn status(&self) -> ChannelStatus {
        let primary = self.primary_connected.load(Ordering::SeqCst);
        let fallback = self.fallback_connected.load(Ordering::SeqCst);
        ChannelStatus {
            connected: primary || fallback,
            primary_connected: primary,
            fallback_connected: fallback,
            device_id: self.device_id.clone(),
            last_command: self.history.lock().unwrap_or_else(PoisonError::into_inner).front().cloned(),
        }
    }

    pub(crate) fn set_primary_connected(&self, connected: bool) {
        if self.primary_connected.swap(connected, Ordering::SeqCst) != connected {
            info!("Primary command transport {}", if connected { "up" } else { "down" });
        }
    }

    pub(crate) fn set_fallback_connected(&self, connected: bool) {
        if self.fallback_connected.swap(connected, Ordering::SeqCst) != connected {
            info!("Fallback command transport {}", if connected { "up" } else { "down" });
        }
    }

    /// Starts the configured transports in the background. Transport failures only flip status flags.
    pub async fn connect(self: &Arc<Self>) -> Result<(), ChannelError> {
        let mut services = self.services.lock().await;
        if services.is_some() {
            debug!("Command channel already connected");
            return Ok(());
        }
        let mut handles = MultiServiceHandle::new();

        if let Some(endpoint) = self.config.ipc_endpoint.clone().filter(|e| !e.trim().is_empty()) {
            let server = MethodServer::new(endpoint, self.clone());
            handles.add(spawn_service(move |stop| async move {
                if let Err(e) = server.serve(stop).await {
                    error!("Method server stopped: {}", e);
                }
            }));
        }

        if let Some(hub) = self.hub.clone() {
            let channel = self.clone();
            let interval = Duration::from_millis(self.config.poll_interval_ms);
            handles.add(spawn_service(move |stop| hub::poll_messages(hub, channel, interval, stop)));
        }

        if handles.is_empty() {
            warn!("No command transport configured, remote control is disabled");
        }
        *services = Some(handles);
        Ok(())
    }

    pub async fn disconnect(&self) {
        let handles = self.services.lock().await.take();
        if let Some(handles) = handles {
            if let Err(e) = handles.shutdown().await {
                warn!("Command transport task ended abnormally: {}", e);
            }
        }
        self.set_primary_connected(false);
        self.set_fallback_connected(false);
    }
}
