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

//! Minimal Chrome DevTools Protocol client over the page's websocket.
//!
//! Requests carry increasing ids and are matched to responses by id; everything without an id is
//! an event and goes to every subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::page::PageDriver;
use super::PlayerError;

const EVENT_BUFFER: usize = 256;

#[derive(Error, Debug)]
pub enum CdpError {
    #[error("Websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("DevTools connection closed")]
    Closed,

    #[error("DevTools error {code}: {message}")]
    Protocol { code: i64, message: String },

    #[error("DevTools call {0} timed out")]
    Timeout(String),
}

#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, CdpError>>>>>;

pub struct CdpSession {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    events: broadcast::Sender<CdpEvent>,
    next_id: AtomicU64,
    call_timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

fn fail_pending(pending: &Pending) {
    let mut pending = pending.lock().unwrap_or_else(PoisonError::into_inner);
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(CdpError::Closed));
    }
}

fn route_incoming(text: &str, pending: &Pending, events: &broadcast::Sender<CdpEvent>) {
    let message: Value = match serde_json::from_str(text) {
        Ok(message) => message,
        Err(e) => {
            debug!("Ignoring malformed DevTools message: {}", e);
            return;
        }
    };

    if let Some(id) = message.get("id").and_then(Value::as_u64) {
        let waiter = pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
        if let Some(tx) = waiter {
            let result = match message.get("error") {
                Some(error) => Err(CdpError::Protocol {
                    code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                    message: error.get("message").and_then(Value::as_str).unwrap_or_default().to_string(),
                }),
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
    } else if let Some(method) = message.get("method").and_then(Value::as_str) {
        let params = message.get("params").cloned().unwrap_or(Value::Null);
        let _ = events.send(CdpEvent { method: method.to_string(), params });
    }
}

impl CdpSession {
    pub async fn connect(ws_url: &str, call_timeout: Duration) -> Result<Self, CdpError> {
        let (stream, _) = tokio_tungstenite::connect_async(ws_url).await?;
        let (mut sink, mut source) = stream.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(EVENT_BUFFER);

        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("DevTools send failed: {}", e);
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = source.next().await {
                match message {
                    Ok(Message::Text(text)) => route_incoming(text.as_str(), &reader_pending, &reader_events),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("DevTools connection error: {}", e);
                        break;
                    }
                }
            }
            debug!("DevTools connection closed");
            fail_pending(&reader_pending);
        });

        info!("Connected to DevTools at {}", ws_url);
        Ok(Self {
            outgoing,
            pending,
            events,
            next_id: AtomicU64::new(1),
            call_timeout,
            tasks: vec![writer, reader],
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, CdpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(id, tx);

        let request = json!({ "id": id, "method": method, "params": params });
        if self.outgoing.send(Message::text(request.to_string())).is_err() {
            self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
            return Err(CdpError::Closed);
        }

        match tokio::time::timeout(self.call_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CdpError::Closed),
            Err(_) => {
                self.pending.lock().unwrap_or_else(PoisonError::into_inner).remove(&id);
                Err(CdpError::Timeout(method.to_string()))
            }
        }
    }
}

impl Drop for CdpSession {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Waits for the first event named in `methods`. `false` on timeout or closed connection.
async fn wait_for_event(events: &mut broadcast::Receiver<CdpEvent>, methods: &[&str], timeout: Duration) -> bool {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if methods.contains(&event.method.as_str()) => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

/// A page target driven over DevTools.
pub struct CdpPage {
    session: Arc<CdpSession>,
    dialog_task: Option<JoinHandle<()>>,
}

impl CdpPage {
    pub async fn attach(session: CdpSession) -> Result<Self, CdpError> {
        let session = Arc::new(session);
        session.call("Page.enable", json!({})).await?;
        session.call("Runtime.enable", json!({})).await?;
        session.call("Page.bringToFront", json!({})).await?;
        Ok(Self { session, dialog_task: None })
    }

    /// Answers prompt dialogs with `prompt_answer` and dismisses every other dialog.
    pub fn handle_dialogs(&mut self, prompt_answer: Option<String>) {
        let session = self.session.clone();
        let mut events = session.subscribe();
        let task = tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.method != "Page.javascriptDialogOpening" {
                    continue;
                }
                let is_prompt = event.params.get("type").and_then(Value::as_str) == Some("prompt");
                let params = match (&prompt_answer, is_prompt) {
                    (Some(answer), true) => {
                        info!("Answering password prompt dialog");
                        json!({ "accept": true, "promptText": answer })
                    }
                    _ => json!({ "accept": false }),
                };
                if let Err(e) = session.call("Page.handleJavaScriptDialog", params).await {
                    warn!("Failed to handle page dialog: {}", e);
                }
            }
        });
        if let Some(previous) = self.dialog_task.replace(task) {
            previous.abort();
        }
    }

    async fn mouse(&self, kind: &str, x: i64, y: i64) -> Result<(), CdpError> {
        let mut params = json!({ "type": kind, "x": x, "y": y });
        if kind != "mouseMoved" {
            params["button"] = json!("left");
            params["clickCount"] = json!(1);
        }
        self.session.call("Input.dispatchMouseEvent", params).await.map(|_| ())
    }
}

impl Drop for CdpPage {
    fn drop(&mut self) {
        if let Some(task) = self.dialog_task.take() {
            task.abort();
        }
    }
}

#[async_trait]
impl PageDriver for CdpPage {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), PlayerError> {
        let mut events = self.session.subscribe();
        let result = self.session.call("Page.navigate", json!({ "url": url })).await?;
        if let Some(error) = result.get("errorText").and_then(Value::as_str) {
            return Err(PlayerError::Navigation(format!("{url}: {error}")));
        }
        if wait_for_event(&mut events, &["Page.loadEventFired"], timeout).await {
            Ok(())
        } else {
            Err(PlayerError::Timeout(timeout))
        }
    }

    async fn evaluate(&self, script: &str) -> Result<Value, PlayerError> {
        let result = self
            .session
            .call(
                "Runtime.evaluate",
                json!({ "expression": script, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            let text = details
                .pointer("/exception/description")
                .or_else(|| details.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("script exception");
            return Err(PlayerError::Script(text.to_string()));
        }
        Ok(result.pointer("/result/value").cloned().unwrap_or(Value::Null))
    }

    async fn move_mouse(&self, x: i64, y: i64) -> Result<(), PlayerError> {
        Ok(self.mouse("mouseMoved", x, y).await?)
    }

    async fn click(&self, x: i64, y: i64) -> Result<(), PlayerError> {
        self.mouse("mouseMoved", x, y).await?;
        self.mouse("mousePressed", x, y).await?;
        self.mouse("mouseReleased", x, y).await?;
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<(), PlayerError> {
        self.session.call("Input.insertText", json!({ "text": text })).await?;
        Ok(())
    }

    async fn press_enter(&self) -> Result<(), PlayerError> {
        for kind in ["keyDown", "keyUp"] {
            let mut params = json!({ "type": kind, "key": "Enter", "code": "Enter", "windowsVirtualKeyCode": 13 });
            if kind == "keyDown" {
                params["text"] = json!("\r");
            }
            self.session.call("Input.dispatchKeyEvent", params).await?;
        }
        Ok(())
    }

    async fn wait_for_navigation(&self, timeout: Duration) -> Result<bool, PlayerError> {
        let mut events = self.session.subscribe();
        Ok(wait_for_event(&mut events, &["Page.frameNavigated", "Page.loadEventFired"], timeout).await)
    }

    async fn url(&self) -> Result<String, PlayerError> {
        let value = self.evaluate("window.location.href").await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn close(&self) -> Result<(), PlayerError> {
        self.session.call("Page.close", json!({})).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn responses_are_routed_by_id() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(4);
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(7, tx);

        route_incoming(r#"{"id": 7, "result": {"frameId": "F1"}}"#, &pending, &events);
        assert_eq!(rx.try_recv().unwrap().unwrap(), json!({"frameId": "F1"}));
        assert!(pending.lock().unwrap().is_empty());
    }

    #[test]
    fn protocol_errors_are_reported() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(4);
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(3, tx);

        route_incoming(r#"{"id": 3, "error": {"code": -32000, "message": "No node"}}"#, &pending, &events);
        match rx.try_recv().unwrap() {
            Err(CdpError::Protocol { code, message }) => {
                assert_eq!(code, -32000);
                assert_eq!(message, "No node");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn events_reach_subscribers() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, mut rx) = broadcast::channel(4);

        route_incoming(r#"{"method": "Page.loadEventFired", "params": {"timestamp": 1.5}}"#, &pending, &events);
        let event = rx.try_recv().unwrap();
        assert_eq!(event.method, "Page.loadEventFired");
        assert_eq!(event.params["timestamp"], 1.5);
    }

    #[test]
    fn closing_fails_every_waiter() {
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (tx, mut rx) = oneshot::channel();
        pending.lock().unwrap().insert(1, tx);

        fail_pending(&pending);
        assert!(matches!(rx.try_recv().unwrap(), Err(CdpError::Closed)));
    }

    #[tokio::test]
    async fn event_wait_gives_up_after_timeout() {
        let (events, mut rx) = broadcast::channel::<CdpEvent>(4);
        events.send(CdpEvent { method: "Network.dataReceived".into(), params: Value::Null }).unwrap();
        assert!(!wait_for_event(&mut rx, &["Page.loadEventFired"], Duration::from_millis(20)).await);

        events.send(CdpEvent { method: "Page.loadEventFired".into(), params: Value::Null }).unwrap();
        assert!(wait_for_event(&mut rx, &["Page.loadEventFired"], Duration::from_millis(20)).await);
    }
}
