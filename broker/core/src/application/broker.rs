// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Broker Handle
//
// Owns the registry, the fan-out worker and the ingest loop for one broker
// instance. Whoever bootstraps the broker holds this handle and passes it
// (or the pieces it exposes) to collaborators; there is no global instance.

use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::agent_factory::AgentFactory;
use crate::application::fan_out::FanOutWorker;
use crate::application::ingest::{IngestLoop, IngestSettings};
use crate::application::registry::{AgentRegistry, AgentRequest, RegistryError};
use crate::domain::agent::Agent;
use crate::domain::broker_config::BrokerConfigManifest;
use crate::domain::channel::AgentTransport;
use crate::domain::companion::CompanionRuntime;
use crate::infrastructure::event_bus::EventBus;

pub struct Broker {
    config: BrokerConfigManifest,
    registry: Arc<AgentRegistry>,
    worker: Arc<FanOutWorker>,
    ingest: Arc<IngestLoop>,
    listener: Mutex<Option<JoinHandle<u64>>>,
}

impl Broker {
    /// Broker wired to named pipes, with companions launched only when the
    /// configuration enables them.
    #[cfg(unix)]
    pub fn new(config: BrokerConfigManifest) -> Self {
        use crate::infrastructure::companion::{DisabledCompanionRuntime, ProcessCompanionRuntime};
        use crate::infrastructure::fifo::FifoTransport;

        let agents = &config.spec.agents;
        let transport = Arc::new(FifoTransport::new(
            agents.channel_dir.clone(),
            agents.connect_timeout(),
            agents.write_timeout(),
        ));
        let companions: Arc<dyn CompanionRuntime> = if config.spec.companion.enabled {
            Arc::new(ProcessCompanionRuntime::from_config(&config.spec.companion))
        } else {
            Arc::new(DisabledCompanionRuntime)
        };

        Self::with_transport(config, transport, companions)
    }

    pub fn with_transport(
        config: BrokerConfigManifest,
        transport: Arc<dyn AgentTransport>,
        companions: Arc<dyn CompanionRuntime>,
    ) -> Self {
        let factory = AgentFactory::from_config(&config, transport, companions);
        let registry = Arc::new(AgentRegistry::new(factory, EventBus::with_default_capacity()));
        let worker = Arc::new(FanOutWorker::new(Arc::clone(&registry)));
        let ingest = Arc::new(IngestLoop::new(
            Arc::clone(&worker),
            IngestSettings::from(&config.spec.ingest),
        ));

        Self {
            config,
            registry,
            worker,
            ingest,
            listener: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BrokerConfigManifest {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn worker(&self) -> &Arc<FanOutWorker> {
        &self.worker
    }

    pub fn ingest(&self) -> &Arc<IngestLoop> {
        &self.ingest
    }

    pub fn events(&self) -> &EventBus {
        self.registry.event_bus()
    }

    /// Schedules creation of every configured initial agent.
    pub fn register_initial_agents(&self) -> Vec<JoinHandle<Result<Arc<Agent>, RegistryError>>> {
        self.config
            .spec
            .initial_agents
            .iter()
            .map(|initial| {
                self.registry
                    .create_async_with(AgentRequest::from(initial), None)
            })
            .collect()
    }

    /// Starts the ingest listener on the configured channel.
    #[cfg(unix)]
    pub fn start(&self) -> Result<()> {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            anyhow::bail!("broker is already listening");
        }
        if self.ingest.is_stopped() {
            anyhow::bail!("broker has been shut down");
        }

        let ingest = Arc::clone(&self.ingest);
        let path = self.config.ingest_path();
        *listener = Some(tokio::spawn(async move { ingest.listen(&path).await }));
        Ok(())
    }

    /// Starts the ingest loop on an arbitrary byte stream instead of the
    /// configured named pipe.
    pub fn start_with<R>(&self, reader: R) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
    {
        let mut listener = self.listener.lock();
        if listener.is_some() {
            anyhow::bail!("broker is already listening");
        }

        let ingest = Arc::clone(&self.ingest);
        *listener = Some(tokio::spawn(async move { ingest.run(reader).await }));
        Ok(())
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Stops ingest, joins the listener, lets in-flight workers finish, then
    /// tears the registry down.
    pub async fn shutdown(&self) {
        info!("Shutting down broker");
        self.ingest.stop();

        let listener = self.listener.lock().take();
        if let Some(handle) = listener {
            match handle.await {
                Ok(dispatched) => info!(dispatched, "Ingest listener stopped"),
                Err(e) => warn!(error = %e, "Ingest listener ended abnormally"),
            }
        }

        self.ingest.drain().await;
        self.registry.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::agent::AgentId;
    use crate::domain::broker_config::InitialAgent;
    use crate::infrastructure::companion::DisabledCompanionRuntime;
    use crate::infrastructure::in_memory::InMemoryTransport;

    fn broker(config: BrokerConfigManifest) -> (Broker, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        let broker = Broker::with_transport(
            config,
            transport.clone(),
            Arc::new(DisabledCompanionRuntime),
        );
        (broker, transport)
    }

    #[tokio::test]
    async fn test_initial_agents_are_registered_with_ranges() {
        let mut config = BrokerConfigManifest::default();
        config.spec.initial_agents = vec![
            InitialAgent {
                id: 1,
                channel: Some("Robot 1".to_string()),
                range: Some(2.5),
            },
            InitialAgent {
                id: 2,
                channel: None,
                range: None,
            },
        ];
        let (broker, _) = broker(config);

        for handle in broker.register_initial_agents() {
            handle.await.unwrap().unwrap();
        }

        let first = broker.registry().get(AgentId(1)).unwrap();
        assert_eq!(first.endpoint().name(), "Robot_1");
        assert_eq!(first.range(), 2.5);
        assert_eq!(broker.registry().get(AgentId(2)).unwrap().range(), 10.0);
        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_start_twice_is_refused() {
        let (broker, _) = broker(BrokerConfigManifest::default());
        let (_client, server) = tokio::io::duplex(64);

        broker.start_with(server).unwrap();
        let (_client2, server2) = tokio::io::duplex(64);
        assert!(broker.start_with(server2).is_err());

        broker.shutdown().await;
        assert!(!broker.is_listening());
    }
}
