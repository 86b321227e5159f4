// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::agent::{AgentId, Position};

/// Notifications the broker publishes for observers such as a map view.
///
/// `AgentMoved` is the "agent position changed" notification: observers get
/// the id and are expected to read anything else through the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerEvent {
    AgentRegistered {
        agent_id: AgentId,
        channel: String,
        registered_at: DateTime<Utc>,
    },
    AgentMoved {
        agent_id: AgentId,
        position: Position,
        previous: Position,
        moved_at: DateTime<Utc>,
    },
    AgentRemoved {
        agent_id: AgentId,
        removed_at: DateTime<Utc>,
    },
}

impl BrokerEvent {
    pub fn agent_id(&self) -> AgentId {
        match self {
            Self::AgentRegistered { agent_id, .. }
            | Self::AgentMoved { agent_id, .. }
            | Self::AgentRemoved { agent_id, .. } => *agent_id,
        }
    }
}
