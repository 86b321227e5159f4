// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Ingest Loop
//!
//! Reads newline-terminated messages from the shared inbound channel and
//! hands each one to a [`FanOutWorker`] on its own task.
//!
//! Framing: bytes accumulate until a `\n` arrives; the newline (and a
//! preceding `\r`) is stripped. A read that returns nothing is *not* end of
//! stream: the loop backs off for `idle_poll` and reads again. Only
//! [`IngestLoop::stop`] ends it, and a partial message pending at that
//! moment is discarded.
//!
//! Dispatch is bounded by a semaphore of `max_inflight_workers` permits.
//! When every permit is taken the loop waits for one before reading on.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::application::fan_out::FanOutWorker;
use crate::domain::broker_config::IngestConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSettings {
    pub max_inflight_workers: usize,
    pub idle_poll: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            max_inflight_workers: 64,
            idle_poll: Duration::from_millis(10),
        }
    }
}

impl From<&IngestConfig> for IngestSettings {
    fn from(config: &IngestConfig) -> Self {
        Self {
            max_inflight_workers: config.max_inflight_workers.max(1),
            idle_poll: config.idle_poll(),
        }
    }
}

pub struct IngestLoop {
    worker: Arc<FanOutWorker>,
    settings: IngestSettings,
    stop: CancellationToken,
    workers: TaskTracker,
    permits: Arc<Semaphore>,
}

impl IngestLoop {
    pub fn new(worker: Arc<FanOutWorker>, settings: IngestSettings) -> Self {
        let permits = Arc::new(Semaphore::new(settings.max_inflight_workers.max(1)));
        Self {
            worker,
            settings,
            stop: CancellationToken::new(),
            workers: TaskTracker::new(),
            permits,
        }
    }

    pub fn settings(&self) -> IngestSettings {
        self.settings
    }

    /// Requests the loop to end. A pending read is abandoned, in-flight
    /// workers keep running.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Fan-out workers currently running.
    pub fn in_flight(&self) -> usize {
        self.workers.len()
    }

    /// Waits until every dispatched worker has finished.
    pub async fn drain(&self) {
        self.workers.close();
        self.workers.wait().await;
    }

    /// Opens (creating if needed) the named pipe at `path` and runs the loop
    /// on it. An open failure is logged and ends this listener only.
    /// Returns the number of messages dispatched.
    #[cfg(unix)]
    pub async fn listen(&self, path: &std::path::Path) -> u64 {
        let receiver = match crate::infrastructure::fifo::open_ingest(path) {
            Ok(receiver) => receiver,
            Err(e) => {
                tracing::error!(
                    channel = %path.display(),
                    error = %e,
                    "Cannot open ingest channel"
                );
                return 0;
            }
        };

        info!(channel = %path.display(), "Listening for agent messages");
        let dispatched = self.run(receiver).await;
        info!(channel = %path.display(), dispatched, "Ingest channel closed");
        dispatched
    }

    /// Runs the read/dispatch loop on any byte stream until stopped.
    pub async fn run<R>(&self, reader: R) -> u64
    where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(reader);
        let mut pending = Vec::new();
        let mut dispatched = 0u64;
        self.workers.reopen();

        loop {
            let read = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                read = reader.read_until(b'\n', &mut pending) => read,
            };

            match read {
                Ok(0) => {
                    if !self.idle().await {
                        break;
                    }
                }
                Ok(_) if pending.last() != Some(&b'\n') => {
                    // Stream paused mid-line; keep what we have and read on.
                    if !self.idle().await {
                        break;
                    }
                }
                Ok(_) => {
                    let frame = std::mem::take(&mut pending);
                    let Some(message) = decode_frame(frame) else {
                        continue;
                    };
                    if !self.dispatch(message).await {
                        break;
                    }
                    dispatched += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Read from ingest channel failed");
                    if !self.idle().await {
                        break;
                    }
                }
            }
        }

        if !pending.is_empty() {
            debug!(bytes = pending.len(), "Discarding partial message at shutdown");
        }
        self.workers.close();
        dispatched
    }

    /// Sleeps for the idle back-off. Returns `false` if stopped meanwhile.
    async fn idle(&self) -> bool {
        tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.settings.idle_poll) => true,
        }
    }

    /// Hands the message to a worker task. Returns `false` if stopped while
    /// waiting for a free slot.
    async fn dispatch(&self, message: String) -> bool {
        let permit = tokio::select! {
            biased;
            _ = self.stop.cancelled() => return false,
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };

        metrics::counter!("proxcast_messages_ingested_total").increment(1);
        let worker = Arc::clone(&self.worker);
        self.workers.spawn(async move {
            worker.process(&message).await;
            drop(permit);
        });
        true
    }
}

/// Strips the frame terminator. Blank lines and invalid UTF-8 yield `None`.
fn decode_frame(mut frame: Vec<u8>) -> Option<String> {
    if frame.last() == Some(&b'\n') {
        frame.pop();
    }
    if frame.last() == Some(&b'\r') {
        frame.pop();
    }

    match String::from_utf8(frame) {
        Ok(text) if text.trim().is_empty() => None,
        Ok(text) => Some(text),
        Err(e) => {
            warn!(error = %e, "Dropping message that is not valid UTF-8");
            metrics::counter!("proxcast_messages_rejected_total", "reason" => "encoding")
                .increment(1);
            None
        }
    }
}
