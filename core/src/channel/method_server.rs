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

//! Primary command transport: msgpack-rpc over a local IPC endpoint (Unix socket or named pipe).
//!
//! The hub bridge forwards each direct-method invocation as a request whose method is the command
//! name and whose first parameter is the JSON payload. The reply is a map `{status, body}`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use log::{debug, error, info, warn};
use msgpack_rpc::{serve, Service, Value};
use parity_tokio_ipc::Endpoint;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinSet;
use tokio_util::compat::TokioAsyncReadCompatExt;

use super::{ChannelError, CommandChannel, MethodResponse};
use crate::service::StopHandle;

pub fn json_to_msgpack(value: &serde_json::Value) -> Value {
    match value {
        serde_json::Value::Null => Value::Nil,
        serde_json::Value::Bool(b) => Value::from(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                Value::from(i)
            } else if let Some(i) = n.as_i64() {
                Value::from(i)
            } else {
                Value::from(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::from(s.as_str()),
        serde_json::Value::Array(items) => Value::Array(items.iter().map(json_to_msgpack).collect()),
        serde_json::Value::Object(fields) => Value::Map(
            fields
                .iter()
                .map(|(k, v)| (Value::from(k.as_str()), json_to_msgpack(v)))
                .collect(),
        ),
    }
}

pub fn msgpack_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Nil => serde_json::Value::Null,
        Value::Boolean(b) => serde_json::Value::Bool(*b),
        Value::Integer(i) => match (i.as_u64(), i.as_i64()) {
            (Some(u), _) => serde_json::Value::from(u),
            (None, Some(s)) => serde_json::Value::from(s),
            _ => serde_json::Value::Null,
        },
        Value::F32(f) => serde_json::Value::from(*f as f64),
        Value::F64(f) => serde_json::Value::from(*f),
        Value::String(s) => serde_json::Value::from(s.as_str().unwrap_or_default()),
        Value::Binary(bytes) => serde_json::Value::from(String::from_utf8_lossy(bytes).into_owned()),
        Value::Array(items) => serde_json::Value::Array(items.iter().map(msgpack_to_json).collect()),
        Value::Map(entries) => serde_json::Value::Object(
            entries
                .iter()
                .map(|(k, v)| {
                    let key = match k {
                        Value::String(s) => s.as_str().unwrap_or_default().to_string(),
                        other => other.to_string(),
                    };
                    (key, msgpack_to_json(v))
                })
                .collect(),
        ),
        Value::Ext(_, _) => serde_json::Value::Null,
    }
}

fn response_to_msgpack(response: &MethodResponse) -> Value {
    Value::Map(vec![
        (Value::from("status"), Value::from(response.status as u64)),
        (Value::from("body"), json_to_msgpack(&response.body)),
    ])
}

#[derive(Clone)]
struct CommandRpcService {
    channel: Arc<CommandChannel>,
}

impl Service for CommandRpcService {
    type RequestFuture = Pin<Box<dyn Future<Output = Result<Value, Value>> + Send>>;

    fn handle_request(&mut self, method: &str, params: &[Value]) -> Self::RequestFuture {
        let channel = self.channel.clone();
        let method = method.to_string();
        let payload = params.first().map(msgpack_to_json).unwrap_or(serde_json::Value::Null);
        Box::pin(async move {
            let response = channel.handle_direct_method(&method, payload).await;
            Ok(response_to_msgpack(&response))
        })
    }

    fn handle_notification(&mut self, method: &str, _params: &[Value]) {
        debug!("Ignoring IPC notification {}", method);
    }
}

async fn handle_connection<S>(stream: S, channel: Arc<CommandChannel>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("Method client connected");
    let service = CommandRpcService { channel };
    let mut compat_stream = stream.compat();
    serve(&mut compat_stream, service)
        .await
        .map_err(|e| anyhow::anyhow!("msgpack-rpc serve error: {}", e))
}

pub struct MethodServer {
    endpoint: String,
    channel: Arc<CommandChannel>,
}

impl MethodServer {
    pub fn new(endpoint: impl Into<String>, channel: Arc<CommandChannel>) -> Self {
        Self { endpoint: endpoint.into(), channel }
    }

    /// Accepts bridge connections until stopped or the endpoint fails.
    pub async fn serve(&self, mut stop: StopHandle) -> Result<(), ChannelError> {
        let endpoint = &self.endpoint;

        #[cfg(unix)]
        {
            if let Some(parent) = std::path::Path::new(endpoint).parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let _ = std::fs::remove_file(endpoint);
        }

        let incoming = Endpoint::new(endpoint.clone()).incoming().map_err(|e| {
            self.channel.set_primary_connected(false);
            ChannelError::Endpoint(format!("Failed to start IPC endpoint {endpoint}: {e}"))
        })?;
        info!("Command method server listening on: {}", endpoint);
        self.channel.set_primary_connected(true);

        let mut tasks = JoinSet::new();
        tokio::pin!(incoming);
        let result = loop {
            let next = tokio::select! {
                _ = stop.signaled() => break Ok(()),
                next = incoming.next() => next,
            };
            match next {
                Some(Ok(stream)) => {
                    let channel = self.channel.clone();
                    tasks.spawn(async move {
                        if let Err(e) = handle_connection(stream, channel).await {
                            warn!("Method connection ended with error: {e:?}");
                        }
                    });
                }
                Some(Err(e)) => {
                    error!("IPC accept failed: {}", e);
                    break Err(ChannelError::Endpoint(e.to_string()));
                }
                None => break Ok(()),
            }

            while let Some(res) = tasks.try_join_next() {
                if let Err(e) = res {
                    warn!("Method connection task panicked: {e:?}");
                }
            }
        };

        tasks.shutdown().await;
        self.channel.set_primary_connected(false);
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(endpoint);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Command, CommandHandler, CommandOutcome, STATUS_OK};
    use crate::config::ChannelConfig;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, command: Command, payload: &serde_json::Value) -> anyhow::Result<CommandOutcome> {
            Ok(CommandOutcome::ok(command.to_string()).with_data(payload.clone()))
        }
    }

    #[test]
    fn json_and_msgpack_values_convert_both_ways() {
        let original = json!({"volume": 7, "offset": -3, "ratio": 0.5, "tags": ["a", null, true]});
        assert_eq!(msgpack_to_json(&json_to_msgpack(&original)), original);
    }

    #[tokio::test]
    async fn rpc_request_is_answered_with_status_and_body() {
        let channel = Arc::new(CommandChannel::new("kiosk-rpc", ChannelConfig::default()).unwrap());
        channel.register_handler(Arc::new(EchoHandler)).unwrap();
        let mut service = CommandRpcService { channel: channel.clone() };

        let reply = service
            .handle_request("play", &[json_to_msgpack(&json!({"source": "dashboard"}))])
            .await
            .unwrap();
        let reply = msgpack_to_json(&reply);
        assert_eq!(reply["status"], STATUS_OK);
        assert_eq!(reply["body"]["message"], "play");
        assert_eq!(reply["body"]["data"]["source"], "dashboard");
        assert_eq!(channel.history()[0].command, "play");
    }

    #[tokio::test]
    async fn missing_params_mean_null_payload() {
        let channel = Arc::new(CommandChannel::new("kiosk-rpc", ChannelConfig::default()).unwrap());
        channel.register_handler(Arc::new(EchoHandler)).unwrap();
        let mut service = CommandRpcService { channel: channel.clone() };

        let reply = msgpack_to_json(&service.handle_request("status", &[]).await.unwrap());
        assert_eq!(reply["status"], STATUS_OK);
        assert_eq!(channel.history()[0].payload, serde_json::Value::Null);
    }
}
