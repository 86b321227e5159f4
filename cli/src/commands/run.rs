// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `proxcast run` - host the broker until interrupted

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

use proxcast_broker_core::domain::broker_config::{BrokerConfigManifest, InitialAgent};

#[derive(Args, Debug, Clone, Default)]
pub struct RunArgs {
    /// Ingest channel path (overrides configuration)
    #[arg(long, value_name = "PATH")]
    pub ingest: Option<PathBuf>,

    /// Launch a companion process for each agent
    #[arg(long)]
    pub companions: bool,

    /// Register an agent at startup (repeatable)
    #[arg(long = "agent", value_name = "ID")]
    pub agents: Vec<u32>,

    /// Prometheus exporter port (enables metrics)
    #[arg(long, value_name = "PORT")]
    pub metrics_port: Option<u16>,
}

/// Folds command-line overrides into the loaded manifest.
pub fn apply_args(config: &mut BrokerConfigManifest, args: &RunArgs) {
    if let Some(ingest) = &args.ingest {
        config.spec.ingest.channel = ingest.display().to_string();
    }
    if args.companions {
        config.spec.companion.enabled = true;
    }
    for id in &args.agents {
        if config.spec.initial_agents.iter().all(|a| a.id != *id) {
            config.spec.initial_agents.push(InitialAgent {
                id: *id,
                channel: None,
                range: None,
            });
        }
    }
}

fn metrics_port(config: &BrokerConfigManifest, args: &RunArgs) -> Option<u16> {
    args.metrics_port.or_else(|| config.metrics_port())
}

fn install_metrics_exporter(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus exporter")?;
    info!(port, "Prometheus metrics exporter listening");
    Ok(())
}

#[cfg(unix)]
pub async fn execute(mut config: BrokerConfigManifest, args: RunArgs) -> Result<()> {
    use proxcast_broker_core::application::broker::Broker;
    use proxcast_broker_core::domain::events::BrokerEvent;
    use proxcast_broker_core::infrastructure::event_bus::EventBusError;

    apply_args(&mut config, &args);
    config
        .validate()
        .context("Configuration validation failed")?;

    info!(
        name = %config.metadata.name,
        ingest = %config.spec.ingest.channel,
        companions = config.spec.companion.enabled,
        "Configuration loaded"
    );

    if let Some(port) = metrics_port(&config, &args) {
        install_metrics_exporter(port)?;
    }

    let broker = Broker::new(config);
    broker.start()?;

    let mut events = broker.events().subscribe();
    let observer = tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => break,
            };
            match event {
                BrokerEvent::AgentRegistered { agent_id, channel, .. } => {
                    info!(agent_id = %agent_id, channel = %channel, "Agent registered")
                }
                BrokerEvent::AgentRemoved { agent_id, .. } => {
                    info!(agent_id = %agent_id, "Agent removed")
                }
                BrokerEvent::AgentMoved { agent_id, position, .. } => {
                    tracing::trace!(
                        agent_id = %agent_id,
                        x = position.x,
                        y = position.y,
                        "Agent moved"
                    )
                }
            }
        }
    });

    for handle in broker.register_initial_agents() {
        tokio::spawn(async move {
            match handle.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Initial agent not created"),
                Err(e) => error!(error = %e, "Initial agent creation task failed"),
            }
        });
    }

    shutdown_signal().await;

    broker.shutdown().await;
    observer.abort();
    info!("Broker stopped");

    Ok(())
}

#[cfg(not(unix))]
pub async fn execute(_config: BrokerConfigManifest, _args: RunArgs) -> Result<()> {
    anyhow::bail!("proxcast run requires named pipes, which are only available on unix")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
