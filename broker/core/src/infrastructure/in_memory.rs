// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// In-Memory Transport
//
// Records every frame instead of writing to a pipe. Used by tests and by
// embedders that consume deliveries in-process.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::channel::{AgentTransport, ChannelEndpoint, ChannelError, OutboundChannel};

#[derive(Debug)]
pub struct RecordingChannel {
    name: String,
    frames: Mutex<Vec<Vec<u8>>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl RecordingChannel {
    pub fn new(name: impl Into<String>, connected: bool) -> Self {
        Self {
            name: name.into(),
            frames: Mutex::new(Vec::new()),
            connected: AtomicBool::new(connected),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frames received so far, exactly as sent.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    /// Received frames as text with the trailing newline removed.
    pub fn lines(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .map(|frame| {
                let text = String::from_utf8_lossy(frame);
                text.strip_suffix('\n').unwrap_or(&*text).to_string()
            })
            .collect()
    }

    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Simulates the reader going away.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl OutboundChannel for RecordingChannel {
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelError::Closed(self.name.clone()));
        }
        if !self.connected.load(Ordering::Acquire) {
            return Err(ChannelError::NoReader(self.name.clone()));
        }
        self.frames.lock().push(frame.to_vec());
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connected.store(false, Ordering::Release);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire) && !self.closed.load(Ordering::Acquire)
    }
}

/// Transport handing out [`RecordingChannel`]s keyed by channel name.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    channels: Mutex<HashMap<String, Arc<RecordingChannel>>>,
    broken: Mutex<HashSet<String>>,
    unreachable: Mutex<HashSet<String>>,
    provisions: AtomicUsize,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// The channel attached under `name`, if any agent connected to it.
    pub fn channel(&self, name: &str) -> Option<Arc<RecordingChannel>> {
        self.channels.lock().get(name).cloned()
    }

    pub fn lines(&self, name: &str) -> Vec<String> {
        self.channel(name).map(|c| c.lines()).unwrap_or_default()
    }

    /// Makes provisioning `name` fail, as if the pipe could not be created.
    pub fn fail_provision(&self, name: impl Into<String>) {
        self.broken.lock().insert(name.into());
    }

    /// Channels for `name` start without a reader.
    pub fn mark_unreachable(&self, name: impl Into<String>) {
        self.unreachable.lock().insert(name.into());
    }

    /// Number of successful `provision` calls.
    pub fn provision_count(&self) -> usize {
        self.provisions.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AgentTransport for InMemoryTransport {
    async fn provision(&self, name: &str) -> Result<ChannelEndpoint, ChannelError> {
        let path = PathBuf::from("memory").join(name);
        if self.broken.lock().contains(name) {
            return Err(ChannelError::CreateFailed {
                path,
                reason: "provisioning disabled for this channel".to_string(),
            });
        }
        self.provisions.fetch_add(1, Ordering::AcqRel);
        Ok(ChannelEndpoint::new(name, path))
    }

    async fn connect(&self, endpoint: &ChannelEndpoint) -> Arc<dyn OutboundChannel> {
        let connected = !self.unreachable.lock().contains(endpoint.name());
        let channel = Arc::new(RecordingChannel::new(endpoint.name(), connected));
        self.channels
            .lock()
            .insert(endpoint.name().to_string(), Arc::clone(&channel));
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_channel_keeps_frames_in_order() {
        let transport = InMemoryTransport::new();
        let endpoint = transport.provision("robot1").await.unwrap();
        let channel = transport.connect(&endpoint).await;

        channel.send(b"one\n").await.unwrap();
        channel.send(b"two\n").await.unwrap();

        assert_eq!(transport.lines("robot1"), vec!["one", "two"]);
        assert_eq!(transport.provision_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_and_broken_channels() {
        let transport = InMemoryTransport::new();
        transport.fail_provision("broken");
        transport.mark_unreachable("silent");

        assert!(transport.provision("broken").await.is_err());

        let endpoint = transport.provision("silent").await.unwrap();
        let channel = transport.connect(&endpoint).await;
        assert!(!channel.is_connected());
        assert!(matches!(channel.send(b"x\n").await, Err(ChannelError::NoReader(_))));

        transport.channel("silent").unwrap().reconnect();
        channel.send(b"x\n").await.unwrap();
        assert_eq!(transport.lines("silent"), vec!["x"]);
    }

    #[tokio::test]
    async fn test_closed_channel() {
        let channel = RecordingChannel::new("r", true);
        channel.close().await;
        assert!(channel.is_closed());
        assert!(matches!(channel.send(b"x\n").await, Err(ChannelError::Closed(_))));
    }
}
