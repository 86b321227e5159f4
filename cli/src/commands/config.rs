// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use proxcast_broker_core::domain::broker_config::{
    BrokerConfigManifest, InitialAgent, LoggingConfig, MetricsConfig, ObservabilityConfig,
};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./proxcast-config.yaml)
        #[arg(short, long, default_value = "./proxcast-config.yaml")]
        output: PathBuf,

        /// Include sample agents, companion and observability settings
        #[arg(long)]
        examples: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate {
            output,
            examples,
            force,
        } => generate(&output, examples, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = BrokerConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. PROXCAST_CONFIG_PATH: {}",
            std::env::var("PROXCAST_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./proxcast-config.yaml");
        println!("  4. ~/.proxcast/config.yaml");
        println!("  5. /etc/proxcast/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config)?);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Broker:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    let ingest = &config.spec.ingest;
    println!("{}", "Ingest:".bold());
    println!("  Channel: {}", ingest.channel);
    println!("  Max in-flight workers: {}", ingest.max_inflight_workers);
    println!("  Idle poll: {} ms", ingest.idle_poll_ms);
    println!();

    let agents = &config.spec.agents;
    println!("{}", "Agents:".bold());
    println!("  Channel dir: {}", agents.channel_dir);
    println!("  Channel prefix: {}", agents.channel_prefix);
    println!("  Default range: {}", agents.default_range);
    println!(
        "  Timeouts: connect {} ms, write {} ms",
        agents.connect_timeout_ms, agents.write_timeout_ms
    );
    if config.spec.initial_agents.is_empty() {
        println!("  Initial agents: {}", "(none)".dimmed());
    } else {
        println!("  Initial agents:");
        for agent in &config.spec.initial_agents {
            println!(
                "    - {} (channel: {}, range: {})",
                agent.id.to_string().bold(),
                agent.channel.as_deref().unwrap_or("default"),
                agent
                    .range
                    .map(|r| r.to_string())
                    .unwrap_or_else(|| "default".to_string())
            );
        }
    }
    println!();

    let companion = &config.spec.companion;
    println!("{}", "Companion:".bold());
    if companion.enabled {
        println!("  Program: {}", companion.program);
        println!("  Args: {}", companion.args.join(" "));
        println!("  Spawn delay: {} ms", companion.spawn_delay_ms);
    } else {
        println!("  {}", "disabled".dimmed());
    }
    println!();

    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        config.log_level().unwrap_or("info"),
        config.log_format()
    );
    match config.metrics_port() {
        Some(port) => println!("  Metrics: enabled on port {}", port),
        None => println!("  Metrics: {}", "disabled".dimmed()),
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = BrokerConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

/// Manifest written by `config generate`.
pub fn sample_manifest(with_examples: bool) -> BrokerConfigManifest {
    let mut manifest = BrokerConfigManifest::default();
    if with_examples {
        manifest.spec.companion.enabled = true;
        manifest.spec.initial_agents = vec![
            InitialAgent {
                id: 1,
                channel: Some("robot1".to_string()),
                range: None,
            },
            InitialAgent {
                id: 2,
                channel: Some("robot2".to_string()),
                range: Some(25.0),
            },
        ];
        manifest.spec.observability = Some(ObservabilityConfig {
            logging: Some(LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            }),
            metrics: Some(MetricsConfig {
                enabled: true,
                port: 9090,
            }),
        });
    }
    manifest
}

async fn generate(output: &Path, with_examples: bool, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists. Use --force to overwrite",
            output.display()
        );
    }

    sample_manifest(with_examples)
        .to_yaml_file(output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
