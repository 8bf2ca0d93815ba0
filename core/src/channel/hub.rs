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

//! HTTPS device API of the relay hub: the queued cloud-to-device mailbox and device-to-cloud events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{header, Method, RequestBuilder, StatusCode};
use serde_json::Value;

use super::{ChannelError, CommandChannel, InboundMessage, MessageAcknowledger, TelemetrySink};
use crate::config::ChannelConfig;
use crate::service::StopHandle;

pub struct HubClient {
    http: reqwest::Client,
    device_url: String,
    sas_token: Option<String>,
    api_version: String,
}

impl HubClient {
    pub fn new(hub_url: &str, device_id: &str, config: &ChannelConfig) -> Result<Self, ChannelError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;
        Ok(Self {
            http,
            device_url: format!("{}/devices/{}", hub_url.trim_end_matches('/'), device_id),
            sas_token: config.sas_token.clone(),
            api_version: config.api_version.clone(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}/{}", self.device_url, path))
            .query(&[("api-version", self.api_version.as_str())]);
        match &self.sas_token {
            Some(token) => builder.header(header::AUTHORIZATION, token),
            None => builder,
        }
    }

    /// Takes the next queued message, if any. The message stays locked until completed or rejected.
    pub async fn receive(&self) -> Result<Option<InboundMessage>, ChannelError> {
        let response = self.request(Method::GET, "messages/deviceBound").send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::OK => {
                let lock_token = response
                    .headers()
                    .get(header::ETAG)
                    .and_then(|v| v.to_str().ok())
                    .map(|v| v.trim_matches('"').to_string())
                    .unwrap_or_default();
                let body = response.text().await?;
                Ok(Some(InboundMessage { lock_token, body }))
            }
            other => Err(ChannelError::HubStatus(other.as_u16())),
        }
    }

    async fn settle(&self, message: &InboundMessage, reject: bool) -> Result<(), ChannelError> {
        let mut path = format!("messages/deviceBound/{}", message.lock_token);
        if reject {
            path.push_str("?reject");
        }
        let response = self.request(Method::DELETE, &path).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::HubStatus(response.status().as_u16()))
        }
    }
}

#[async_trait]
impl MessageAcknowledger for HubClient {
    async fn complete(&self, message: &InboundMessage) -> Result<(), ChannelError> {
        self.settle(message, false).await
    }

    async fn reject(&self, message: &InboundMessage) -> Result<(), ChannelError> {
        self.settle(message, true).await
    }
}

#[async_trait]
impl TelemetrySink for HubClient {
    async fn send(&self, event: Value) -> Result<(), ChannelError> {
        let response = self.request(Method::POST, "messages/events").json(&event).send().await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::HubStatus(response.status().as_u16()))
        }
    }
}

/// Drains the hub mailbox until stopped. Waits `interval` whenever the mailbox is empty or unreachable.
pub async fn poll_messages(hub: Arc<HubClient>, channel: Arc<CommandChannel>, interval: Duration, mut stop: StopHandle) {
    debug!("Polling hub mailbox every {:?}", interval);
    loop {
        let received = tokio::select! {
            _ = stop.signaled() => break,
            received = hub.receive() => received,
        };
        match received {
            Ok(Some(message)) => {
                channel.set_fallback_connected(true);
                channel.handle_queued_message(&message, hub.as_ref()).await;
                continue;
            }
            Ok(None) => channel.set_fallback_connected(true),
            Err(e) => {
                warn!("Hub mailbox poll failed: {}", e);
                channel.set_fallback_connected(false);
            }
        }
        if stop.sleep_or_stop(interval).await {
            break;
        }
    }
    channel.set_fallback_connected(false);
    debug!("Hub mailbox polling stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers one HTTP request with `response` and hands back the request head.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (url, task)
    }

    fn client(url: &str) -> HubClient {
        let config = ChannelConfig { sas_token: Some("SharedAccessSignature sr=x".into()), ..Default::default() };
        HubClient::new(url, "kiosk-7", &config).unwrap()
    }

    #[tokio::test]
    async fn receive_reads_body_and_lock_token() {
        let (url, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\nETag: \"lock-42\"\r\nContent-Length: 19\r\nConnection: close\r\n\r\n{\"command\":\"play\"}\n",
        )
        .await;

        let message = client(&url).receive().await.unwrap().unwrap();
        assert_eq!(message.lock_token, "lock-42");
        assert_eq!(message.body.trim(), r#"{"command":"play"}"#);

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /devices/kiosk-7/messages/deviceBound?api-version=2020-09-30 "));
        assert!(request.to_ascii_lowercase().contains("authorization: sharedaccesssignature sr=x"));
    }

    #[tokio::test]
    async fn empty_mailbox_is_none() {
        let (url, _server) = one_shot_server("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        assert!(client(&url).receive().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reject_uses_the_lock_token() {
        let (url, server) = one_shot_server("HTTP/1.1 204 No Content\r\nConnection: close\r\n\r\n").await;
        let message = InboundMessage { lock_token: "lock-42".into(), body: String::new() };
        client(&url).reject(&message).await.unwrap();

        let request = server.await.unwrap();
        assert!(request.starts_with("DELETE /devices/kiosk-7/messages/deviceBound/lock-42?reject&api-version=2020-09-30 "));
    }

    #[tokio::test]
    async fn hub_errors_are_reported() {
        let (url, _server) = one_shot_server("HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        assert!(matches!(client(&url).receive().await, Err(ChannelError::HubStatus(401))));
    }
}
