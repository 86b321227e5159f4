// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for Broker Events
//
// In-memory fan-out of registry and movement notifications over a tokio
// broadcast channel. Observers (map views, the CLI) subscribe; the broker
// never waits on them. Slow receivers lag and lose the oldest events.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::agent::AgentId;
use crate::domain::events::BrokerEvent;

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<BrokerEvent>>,
}

impl EventBus {
    /// Capacity is the number of events buffered per receiver before the
    /// oldest ones are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish(&self, event: BrokerEvent) {
        let receiver_count = self.sender.send(event).unwrap_or(0);
        if receiver_count == 0 {
            debug!("No subscribers listening to broker event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Subscribe to the events of a single agent.
    pub fn subscribe_agent(&self, agent_id: AgentId) -> AgentEventReceiver {
        AgentEventReceiver {
            receiver: self.sender.subscribe(),
            agent_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<BrokerEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<BrokerEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<BrokerEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

/// Receiver that skips events about other agents.
pub struct AgentEventReceiver {
    receiver: broadcast::Receiver<BrokerEvent>,
    agent_id: AgentId,
}

impl AgentEventReceiver {
    pub async fn recv(&mut self) -> Result<BrokerEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if event.agent_id() == self.agent_id {
                return Ok(event);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::Position;
    use chrono::Utc;

    fn moved(id: u32, x: f64) -> BrokerEvent {
        BrokerEvent::AgentMoved {
            agent_id: AgentId(id),
            position: Position::new(x, 0.0),
            previous: Position::ORIGIN,
            moved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        event_bus.publish(moved(1, 2.0));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.agent_id(), AgentId(1));
        assert!(matches!(event, BrokerEvent::AgentMoved { .. }));
    }

    #[tokio::test]
    async fn test_agent_filtered_subscription() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe_agent(AgentId(2));

        event_bus.publish(moved(1, 1.0));
        event_bus.publish(moved(2, 5.0));

        match receiver.recv().await.unwrap() {
            BrokerEvent::AgentMoved { agent_id, position, .. } => {
                assert_eq!(agent_id, AgentId(2));
                assert_eq!(position, Position::new(5.0, 0.0));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let event_bus = EventBus::default();
        assert_eq!(event_bus.subscriber_count(), 0);
        event_bus.publish(moved(1, 1.0));
    }

    #[tokio::test]
    async fn test_lagged_receiver() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();

        for i in 0..5 {
            event_bus.publish(moved(i, i as f64));
        }

        assert!(matches!(receiver.try_recv(), Err(EventBusError::Lagged(_))));
    }
}
