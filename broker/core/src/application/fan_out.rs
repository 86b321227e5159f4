// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Proximity Fan-out
//
// One worker invocation per ingested message:
//   decode envelope -> look up sender -> move sender (if active)
//   -> notify observers -> forward raw text to every active agent
//      strictly inside the sender's range, sender excluded.
// Nothing that goes wrong here is returned as an error; the outcome is
// reported for logging, metrics and tests.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, warn};

use crate::application::registry::AgentRegistry;
use crate::domain::agent::{Agent, AgentId, Position};
use crate::domain::envelope::{Envelope, EnvelopeError};
use crate::domain::events::BrokerEvent;

#[derive(Debug, Clone, PartialEq)]
pub enum FanOutOutcome {
    Forwarded {
        sender: AgentId,
        recipients: usize,
        failed: usize,
    },
    Rejected(EnvelopeError),
    UnknownSender(AgentId),
    InactiveSender(AgentId),
}

/// Agents that should receive a message sent from `origin` with `range`.
///
/// Distance must be strictly below the range; an agent exactly on the
/// boundary is out. The sender and inactive agents are never included.
pub fn select_recipients(
    agents: &[Arc<Agent>],
    sender: AgentId,
    origin: Position,
    range: f64,
) -> Vec<Arc<Agent>> {
    agents
        .iter()
        .filter(|agent| agent.id() != sender)
        .filter(|agent| {
            let snapshot = agent.snapshot();
            snapshot.active && origin.distance_to(&snapshot.position) < range
        })
        .cloned()
        .collect()
}

#[derive(Clone)]
pub struct FanOutWorker {
    registry: Arc<AgentRegistry>,
}

impl FanOutWorker {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub async fn process(&self, raw: &str) -> FanOutOutcome {
        let envelope = match Envelope::decode(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(reason = e.reason(), error = %e, "Dropping undecodable message");
                metrics::counter!("proxcast_messages_rejected_total", "reason" => e.reason())
                    .increment(1);
                return FanOutOutcome::Rejected(e);
            }
        };
        let sender_id = envelope.sender_id;

        let Some(sender) = self.registry.get(sender_id) else {
            debug!(agent_id = %sender_id, "Dropping message from unregistered sender");
            metrics::counter!("proxcast_messages_rejected_total", "reason" => "unknown_sender")
                .increment(1);
            return FanOutOutcome::UnknownSender(sender_id);
        };

        let Some(snapshot) = sender.move_if_active(envelope.position) else {
            debug!(agent_id = %sender_id, "Ignoring update from inactive sender");
            metrics::counter!("proxcast_messages_rejected_total", "reason" => "inactive_sender")
                .increment(1);
            return FanOutOutcome::InactiveSender(sender_id);
        };

        self.registry.event_bus().publish(BrokerEvent::AgentMoved {
            agent_id: sender_id,
            position: snapshot.position,
            previous: snapshot.last_position,
            moved_at: Utc::now(),
        });

        let recipients = select_recipients(
            &self.registry.agents(),
            sender_id,
            snapshot.position,
            snapshot.range,
        );
        let results = join_all(recipients.iter().map(|agent| agent.deliver(raw))).await;
        let delivered = results.iter().filter(|ok| **ok).count();
        let failed = results.len() - delivered;

        metrics::counter!("proxcast_messages_forwarded_total").increment(delivered as u64);
        if failed > 0 {
            metrics::counter!("proxcast_delivery_failures_total").increment(failed as u64);
        }

        debug!(
            agent_id = %sender_id,
            x = snapshot.position.x,
            y = snapshot.position.y,
            range = snapshot.range,
            recipients = recipients.len(),
            failed,
            "Fanned out position update"
        );

        FanOutOutcome::Forwarded {
            sender: sender_id,
            recipients: recipients.len(),
            failed,
        }
    }
}
