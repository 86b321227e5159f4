// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::domain::agent::{Agent, AgentId, DEFAULT_RANGE};
use crate::domain::broker_config::BrokerConfigManifest;
use crate::domain::channel::{
    normalize_channel_name, AgentTransport, ChannelEndpoint, DisconnectedChannel,
};
use crate::domain::companion::{CompanionRuntime, CompanionSpec};

pub const DEFAULT_CHANNEL_PREFIX: &str = "proxcast-agent-";

/// Builds fully wired agents: channel provisioned, companion scheduled,
/// writer attached.
pub struct AgentFactory {
    transport: Arc<dyn AgentTransport>,
    companions: Arc<dyn CompanionRuntime>,
    ingest_path: PathBuf,
    channel_prefix: String,
    default_range: f64,
}

impl AgentFactory {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        companions: Arc<dyn CompanionRuntime>,
        ingest_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            transport,
            companions,
            ingest_path: ingest_path.into(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            default_range: DEFAULT_RANGE,
        }
    }

    pub fn from_config(
        config: &BrokerConfigManifest,
        transport: Arc<dyn AgentTransport>,
        companions: Arc<dyn CompanionRuntime>,
    ) -> Self {
        Self::new(transport, companions, config.ingest_path())
            .with_channel_prefix(config.spec.agents.channel_prefix.clone())
            .with_default_range(config.spec.agents.default_range)
    }

    pub fn with_channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    pub fn with_default_range(mut self, range: f64) -> Self {
        self.default_range = range;
        self
    }

    /// Channel name for `id`: the override if given, `<prefix><id>` otherwise,
    /// with spaces turned into underscores either way.
    pub fn channel_name(&self, id: AgentId, name_override: Option<&str>) -> String {
        match name_override {
            Some(name) if !name.trim().is_empty() => normalize_channel_name(name),
            _ => normalize_channel_name(&format!("{}{}", self.channel_prefix, id)),
        }
    }

    /// Provisions the agent's channel, schedules its companion and attaches
    /// the writer. Never fails: an agent whose channel cannot be created is
    /// still returned, permanently disconnected.
    pub async fn build(
        &self,
        id: AgentId,
        name_override: Option<&str>,
        range: Option<f64>,
    ) -> Agent {
        let name = self.channel_name(id, name_override);
        let range = range.unwrap_or(self.default_range);

        let endpoint = match self.transport.provision(&name).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(
                    agent_id = %id,
                    channel = %name,
                    error = %e,
                    "Failed to provision agent channel"
                );
                let endpoint = ChannelEndpoint::new(name.clone(), PathBuf::from(&name));
                return Agent::new(id, endpoint, Arc::new(DisconnectedChannel::new(name)), None)
                    .with_range(range);
            }
        };

        let spec = CompanionSpec {
            agent_id: id,
            channel_name: endpoint.name().to_string(),
            input: endpoint.path().to_path_buf(),
            output: self.ingest_path.clone(),
        };
        let companion = match self.companions.launch(spec) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(agent_id = %id, error = %e, "Agent will run without a companion");
                None
            }
        };

        // The companion opens the read end; connect waits for it.
        let outbound = self.transport.connect(&endpoint).await;

        info!(
            agent_id = %id,
            channel = %endpoint.name(),
            connected = outbound.is_connected(),
            companion = companion.is_some(),
            "Agent created"
        );

        Agent::new(id, endpoint, outbound, companion).with_range(range)
    }
}
