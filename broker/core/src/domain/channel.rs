// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Channel Ports
//!
//! Contracts for the byte channels that carry broker-forwarded messages to
//! agents. The domain only knows about [`ChannelEndpoint`]s and
//! [`OutboundChannel`]s; named pipes live in
//! `crate::infrastructure::fifo`, the recording double in
//! `crate::infrastructure::in_memory`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// A named channel together with the filesystem location backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEndpoint {
    name: String,
    path: PathBuf,
}

impl ChannelEndpoint {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Channel names never contain spaces; they become underscores.
pub fn normalize_channel_name(raw: &str) -> String {
    raw.replace(' ', "_")
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to create channel at {path}: {reason}")]
    CreateFailed { path: PathBuf, reason: String },

    #[error("failed to open channel {channel}: {source}")]
    OpenFailed {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("no reader attached to channel {0}")]
    NoReader(String),

    #[error("channel {0} is not connected")]
    NotConnected(String),

    #[error("write to channel {channel} timed out after {timeout:?}")]
    WriteTimedOut { channel: String, timeout: Duration },

    #[error("write to channel {channel} failed: {source}")]
    WriteFailed {
        channel: String,
        #[source]
        source: std::io::Error,
    },

    #[error("channel {0} is closed")]
    Closed(String),
}

/// Write side of an agent's dedicated channel.
///
/// Implementations serialize `send` calls per channel: each frame is written
/// completely before the next one starts.
#[async_trait]
pub trait OutboundChannel: Send + Sync {
    /// Writes one complete frame.
    async fn send(&self, frame: &[u8]) -> Result<(), ChannelError>;

    /// Releases the underlying handle. Later sends fail with
    /// [`ChannelError::Closed`].
    async fn close(&self);

    fn is_connected(&self) -> bool;
}

/// Creates agent channels and attaches writers to them.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Creates the named channel, or reuses it if it already exists.
    async fn provision(&self, name: &str) -> Result<ChannelEndpoint, ChannelError>;

    /// Attaches a writer to a provisioned channel. Never fails: a channel
    /// nobody reads yet is returned unconnected and logs on use.
    async fn connect(&self, endpoint: &ChannelEndpoint) -> Arc<dyn OutboundChannel>;
}

/// Stand-in for a channel that could not be created. Every send is refused.
#[derive(Debug, Clone)]
pub struct DisconnectedChannel {
    name: String,
}

impl DisconnectedChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl OutboundChannel for DisconnectedChannel {
    async fn send(&self, _frame: &[u8]) -> Result<(), ChannelError> {
        Err(ChannelError::NotConnected(self.name.clone()))
    }

    async fn close(&self) {}

    fn is_connected(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_channel_name() {
        assert_eq!(normalize_channel_name("Robot 1"), "Robot_1");
        assert_eq!(normalize_channel_name("a  b c"), "a__b_c");
        assert_eq!(normalize_channel_name("robot1"), "robot1");
    }

    #[tokio::test]
    async fn test_disconnected_channel_refuses_writes() {
        let channel = DisconnectedChannel::new("ghost");
        let err = channel.send(b"hello\n").await.unwrap_err();
        assert!(matches!(err, ChannelError::NotConnected(ref name) if name == "ghost"));
        assert!(!channel.is_connected());
    }
}
