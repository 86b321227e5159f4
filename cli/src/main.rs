// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Proxcast Broker CLI
//!
//! The `proxcast` binary hosts the proximity broker.
//!
//! ## Commands
//!
//! - `proxcast run` - Listen on the ingest channel until Ctrl+C / SIGTERM
//! - `proxcast config show|validate|generate` - Configuration management
//! - `proxcast inject --id N --x X --y Y` - Write one envelope into a running broker

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use proxcast::commands::{self, ConfigCommand, InjectArgs, RunArgs};
use proxcast::logging::{init_logging, LogFormat};
use proxcast_broker_core::domain::broker_config::BrokerConfigManifest;

/// Proxcast - proximity message broker for multi-agent simulations
#[derive(Parser)]
#[command(name = "proxcast")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "PROXCAST_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, global = true, env = "PROXCAST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker
    #[command(name = "run")]
    Run(RunArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Send a position envelope to a running broker
    #[command(name = "inject")]
    Inject(InjectArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Only `run` needs the configuration before logging is up
    let config = match &cli.command {
        Some(Commands::Run(_)) => Some(
            BrokerConfigManifest::load_or_default(cli.config.clone())
                .context("Failed to load configuration")?,
        ),
        _ => None,
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.as_ref().and_then(|c| c.log_level().map(str::to_string)))
        .unwrap_or_else(|| "info".to_string());
    let format = cli
        .log_format
        .or_else(|| config.as_ref().and_then(|c| c.log_format().parse().ok()))
        .unwrap_or_default();
    init_logging(&level, format)?;

    match cli.command {
        Some(Commands::Run(args)) => {
            let config = config.context("Configuration was not loaded")?;
            commands::run::execute(config, args).await
        }
        Some(Commands::Config { command }) => {
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Inject(args)) => commands::inject::execute(args, cli.config).await,
        None => {
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
