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

//! Background listener tasks with cooperative shutdown.
//!
//! The command transports run as long-lived tokio tasks. Each one receives a [`StopHandle`] and
//! is expected to return promptly once it is signaled; the owner keeps the matching
//! [`ServiceHandle`] (or several of them in a [`MultiServiceHandle`]).

use std::future::Future;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub struct StopHandle {
    shutdown_rx: oneshot::Receiver<()>,
    signaled: bool,
}

impl StopHandle {
    fn new(shutdown_rx: oneshot::Receiver<()>) -> Self {
        Self { shutdown_rx, signaled: false }
    }

    /// Resolves once shutdown was requested or the owning handle was dropped.
    pub async fn signaled(&mut self) {
        if self.signaled {
            return;
        }
        (&mut self.shutdown_rx).await.unwrap_or_default();
        self.signaled = true;
    }

    /// Sleeps for `duration` unless shutdown arrives first. Returns `true` when stopped.
    pub async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.signaled() => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

pub struct ServiceHandle {
    join: JoinHandle<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ServiceHandle {
    pub fn new(join: JoinHandle<()>, shutdown_tx: oneshot::Sender<()>) -> Self {
        Self { join, shutdown_tx: Some(shutdown_tx) }
    }

    pub fn request_shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn shutdown(mut self) -> Result<(), tokio::task::JoinError> {
        self.request_shutdown();
        self.join.await
    }

    pub fn abort(self) {
        self.join.abort();
    }
}

/// Spawns `f` on the runtime, handing it the stop side of a fresh shutdown channel.
pub fn spawn_service<Fut, Func>(f: Func) -> ServiceHandle
where
    Fut: Future<Output = ()> + Send + 'static,
    Func: FnOnce(StopHandle) -> Fut + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let stop = StopHandle::new(shutdown_rx);
    let join = tokio::spawn(async move {
        f(stop).await;
    });
    ServiceHandle::new(join, shutdown_tx)
}

#[derive(Default)]
pub struct MultiServiceHandle {
    handles: Vec<ServiceHandle>,
}

impl MultiServiceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, handle: ServiceHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every task first, then joins them; the first join error is returned.
    pub async fn shutdown(mut self) -> Result<(), tokio::task::JoinError> {
        for h in &mut self.handles {
            h.request_shutdown();
        }
        let mut first_err = None;
        for h in self.handles {
            if let Err(e) = h.join.await {
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn shutdown_wakes_the_task() {
        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let handle = spawn_service(move |mut stop| async move {
            stop.signaled().await;
            flag.store(true, Ordering::SeqCst);
        });

        handle.shutdown().await.unwrap();
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn sleep_or_stop_reports_stop() {
        let (tx, rx) = tokio::sync::oneshot::channel::<bool>();
        let handle = spawn_service(move |mut stop| async move {
            let stopped = stop.sleep_or_stop(Duration::from_secs(60)).await;
            let _ = tx.send(stopped);
        });

        handle.shutdown().await.unwrap();
        assert!(rx.await.unwrap());
    }

    #[tokio::test]
    async fn multi_handle_stops_every_service() {
        let mut multi = MultiServiceHandle::new();
        for _ in 0..3 {
            multi.add(spawn_service(|mut stop| async move { stop.signaled().await }));
        }
        assert_eq!(multi.len(), 3);
        multi.shutdown().await.unwrap();
    }
}
