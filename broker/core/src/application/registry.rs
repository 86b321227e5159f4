// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Registry
//!
//! Maps agent ids to live [`Agent`]s.
//!
//! - The map sits behind a reader/writer lock. Fan-out scans take a cloned,
//!   id-ordered snapshot and release the lock before any channel write.
//! - Creation is idempotent. Concurrent creations of the same id share one
//!   [`OnceCell`], so the channel and companion are provisioned exactly once.
//! - Background creations run on a [`TaskTracker`]; [`AgentRegistry::shutdown`]
//!   joins them all before closing the agents.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::application::agent_factory::AgentFactory;
use crate::domain::agent::{Agent, AgentId};
use crate::domain::broker_config::InitialAgent;
use crate::domain::events::BrokerEvent;
use crate::infrastructure::event_bus::EventBus;

/// Invoked with the agent once a background creation completes.
pub type ReadyCallback = Box<dyn FnOnce(Arc<Agent>) + Send + 'static>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("agent registry is shut down")]
    ShutDown,
}

/// Parameters for creating one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentRequest {
    pub id: AgentId,
    pub channel: Option<String>,
    pub range: Option<f64>,
}

impl AgentRequest {
    pub fn new(id: impl Into<AgentId>) -> Self {
        Self {
            id: id.into(),
            channel: None,
            range: None,
        }
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn with_range(mut self, range: f64) -> Self {
        self.range = Some(range);
        self
    }
}

impl From<&InitialAgent> for AgentRequest {
    fn from(initial: &InitialAgent) -> Self {
        Self {
            id: AgentId(initial.id),
            channel: initial.channel.clone(),
            range: initial.range,
        }
    }
}

type CreationCell = Arc<OnceCell<Arc<Agent>>>;

pub struct AgentRegistry {
    factory: AgentFactory,
    agents: RwLock<BTreeMap<AgentId, Arc<Agent>>>,
    pending: Mutex<HashMap<AgentId, CreationCell>>,
    creations: TaskTracker,
    event_bus: EventBus,
    closed: AtomicBool,
}

impl AgentRegistry {
    pub fn new(factory: AgentFactory, event_bus: EventBus) -> Self {
        Self {
            factory,
            agents: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(HashMap::new()),
            creations: TaskTracker::new(),
            event_bus,
            closed: AtomicBool::new(false),
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns the agent for `id`, creating it if needed.
    ///
    /// An existing agent is returned untouched: no new channel, no new
    /// companion, no reset of position, range or active flag.
    pub async fn create(
        &self,
        id: AgentId,
        channel: Option<&str>,
    ) -> Result<Arc<Agent>, RegistryError> {
        self.create_with(AgentRequest {
            id,
            channel: channel.map(str::to_string),
            range: None,
        })
        .await
    }

    pub async fn create_with(&self, request: AgentRequest) -> Result<Arc<Agent>, RegistryError> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        if let Some(existing) = self.get(request.id) {
            return Ok(existing);
        }

        let id = request.id;
        let cell = Arc::clone(self.pending.lock().entry(id).or_default());

        let result = cell
            .get_or_try_init(|| self.build_and_insert(request))
            .await
            .cloned();

        let mut pending = self.pending.lock();
        if pending.get(&id).is_some_and(|current| Arc::ptr_eq(current, &cell)) {
            pending.remove(&id);
        }

        result
    }

    async fn build_and_insert(&self, request: AgentRequest) -> Result<Arc<Agent>, RegistryError> {
        if let Some(existing) = self.get(request.id) {
            return Ok(existing);
        }

        let agent = Arc::new(
            self.factory
                .build(request.id, request.channel.as_deref(), request.range)
                .await,
        );

        let inserted = {
            let mut agents = self.agents.write();
            if self.is_shut_down() {
                None
            } else {
                let entry = Arc::clone(
                    agents
                        .entry(request.id)
                        .or_insert_with(|| Arc::clone(&agent)),
                );
                let fresh = Arc::ptr_eq(&entry, &agent);
                let count = agents.len();
                Some((entry, fresh, count))
            }
        };

        match inserted {
            None => {
                // Teardown won the race; nobody else will close this one.
                agent.close().await;
                Err(RegistryError::ShutDown)
            }
            Some((entry, fresh, count)) => {
                if fresh {
                    metrics::gauge!("proxcast_agents_registered").set(count as f64);
                    self.event_bus.publish(BrokerEvent::AgentRegistered {
                        agent_id: request.id,
                        channel: entry.endpoint().name().to_string(),
                        registered_at: Utc::now(),
                    });
                } else {
                    agent.close().await;
                }
                Ok(entry)
            }
        }
    }

    /// Schedules creation on a background task tracked by the registry.
    ///
    /// `on_ready` runs with the agent once it exists. The returned handle may
    /// be awaited or dropped; [`shutdown`](Self::shutdown) joins the task
    /// either way.
    pub fn create_async(
        self: &Arc<Self>,
        id: AgentId,
        channel: Option<String>,
        on_ready: Option<ReadyCallback>,
    ) -> JoinHandle<Result<Arc<Agent>, RegistryError>> {
        self.create_async_with(
            AgentRequest {
                id,
                channel,
                range: None,
            },
            on_ready,
        )
    }

    pub fn create_async_with(
        self: &Arc<Self>,
        request: AgentRequest,
        on_ready: Option<ReadyCallback>,
    ) -> JoinHandle<Result<Arc<Agent>, RegistryError>> {
        let registry = Arc::clone(self);
        self.creations.spawn(async move {
            let id = request.id;
            match registry.create_with(request).await {
                Ok(agent) => {
                    if let Some(callback) = on_ready {
                        callback(Arc::clone(&agent));
                    }
                    Ok(agent)
                }
                Err(e) => {
                    warn!(agent_id = %id, error = %e, "Background agent creation abandoned");
                    Err(e)
                }
            }
        })
    }

    /// Number of background creations still running.
    pub fn pending_creations(&self) -> usize {
        self.creations.len()
    }

    pub fn get(&self, id: AgentId) -> Option<Arc<Agent>> {
        self.agents.read().get(&id).cloned()
    }

    pub fn contains(&self, id: AgentId) -> bool {
        self.agents.read().contains_key(&id)
    }

    /// All agents in ascending id order.
    pub fn agents(&self) -> Vec<Arc<Agent>> {
        self.agents.read().values().cloned().collect()
    }

    pub fn ids(&self) -> Vec<AgentId> {
        self.agents.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.read().is_empty()
    }

    /// The agent after `id` in id order, wrapping to the first.
    pub fn next_after(&self, id: AgentId) -> Option<Arc<Agent>> {
        let agents = self.agents.read();
        agents
            .range((Bound::Excluded(id), Bound::Unbounded))
            .next()
            .or_else(|| agents.iter().next())
            .map(|(_, agent)| Arc::clone(agent))
    }

    /// The agent before `id` in id order, wrapping to the last.
    pub fn previous_before(&self, id: AgentId) -> Option<Arc<Agent>> {
        let agents = self.agents.read();
        agents
            .range(..id)
            .next_back()
            .or_else(|| agents.iter().next_back())
            .map(|(_, agent)| Arc::clone(agent))
    }

    /// Returns `false` if no such agent exists.
    pub fn set_active(&self, id: AgentId, active: bool) -> bool {
        match self.get(id) {
            Some(agent) => {
                agent.set_active(active);
                true
            }
            None => false,
        }
    }

    /// Flips the agent's active flag and returns the new value.
    pub fn toggle_active(&self, id: AgentId) -> Option<bool> {
        self.get(id).map(|agent| agent.toggle_active())
    }

    /// Unregisters an agent and closes it: channel released, companion
    /// joined. In-flight deliveries holding the agent finish first or fail
    /// with a closed-channel error.
    pub async fn remove(&self, id: AgentId) -> Option<Arc<Agent>> {
        let (agent, count) = {
            let mut agents = self.agents.write();
            let agent = agents.remove(&id)?;
            (agent, agents.len())
        };

        agent.close().await;
        metrics::gauge!("proxcast_agents_registered").set(count as f64);
        self.event_bus.publish(BrokerEvent::AgentRemoved {
            agent_id: id,
            removed_at: Utc::now(),
        });
        info!(agent_id = %id, "Agent removed");
        Some(agent)
    }

    /// Refuses further creations, joins every background creation, then
    /// closes all agents and waits for their companions.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Agent registry already shut down");
            return;
        }

        self.creations.close();
        let pending = self.creations.len();
        if pending > 0 {
            info!(pending, "Waiting for background agent creations");
        }
        self.creations.wait().await;

        let drained = std::mem::take(&mut *self.agents.write());
        let count = drained.len();
        join_all(drained.values().map(|agent| agent.close())).await;

        metrics::gauge!("proxcast_agents_registered").set(0.0);
        info!(agents = count, "Agent registry shut down");
    }
}

impl Drop for AgentRegistry {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) && !self.agents.get_mut().is_empty() {
            warn!(
                agents = self.agents.get_mut().len(),
                "Agent registry dropped without shutdown; companions are detached"
            );
            for agent in self.agents.get_mut().values() {
                agent.detach_companion();
            }
        }
    }
}
