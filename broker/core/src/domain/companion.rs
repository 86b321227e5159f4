// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::PathBuf;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::agent::AgentId;

/// Everything a runtime needs to start the process behind one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompanionSpec {
    pub agent_id: AgentId,
    pub channel_name: String,
    /// Channel the companion reads broker-forwarded messages from.
    pub input: PathBuf,
    /// Broker ingest channel the companion writes its envelopes to.
    pub output: PathBuf,
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to spawn companion: {0}")]
    SpawnFailed(String),

    #[error("Invalid companion command: {0}")]
    InvalidCommand(String),
}

/// Handle on the task supervising a companion process.
///
/// [`shutdown`](Self::shutdown) asks the supervisor to stop its process and
/// waits for it; [`detach`](Self::detach) leaves it running unattended.
#[derive(Debug)]
pub struct CompanionHandle {
    agent_id: AgentId,
    task: JoinHandle<()>,
    stop: CancellationToken,
}

impl CompanionHandle {
    pub fn new(agent_id: AgentId, task: JoinHandle<()>, stop: CancellationToken) -> Self {
        Self {
            agent_id,
            task,
            stop,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!(agent_id = %self.agent_id, error = %e, "Companion supervisor ended abnormally");
        } else {
            debug!(agent_id = %self.agent_id, "Companion joined");
        }
    }

    pub fn detach(self) {
        warn!(agent_id = %self.agent_id, "Detaching companion; it may keep writing to the broker");
    }
}

/// Starts companion processes for newly created agents.
pub trait CompanionRuntime: Send + Sync {
    /// Schedules the companion for `spec`. Returns `Ok(None)` when this
    /// runtime does not run companions at all.
    fn launch(&self, spec: CompanionSpec) -> Result<Option<CompanionHandle>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shutdown_cancels_and_joins_supervisor() {
        let stop = CancellationToken::new();
        let observed = stop.clone();
        let task = tokio::spawn(async move { observed.cancelled().await });
        let handle = CompanionHandle::new(AgentId(3), task, stop.clone());

        assert!(!handle.is_finished());
        handle.shutdown().await;
        assert!(stop.is_cancelled());
    }
}
