// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! `proxcast inject` - write one position envelope into a running broker

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;

use proxcast_broker_core::domain::broker_config::BrokerConfigManifest;

#[derive(Args, Debug, Clone)]
pub struct InjectArgs {
    /// Sender agent id
    #[arg(long)]
    pub id: u32,

    /// X coordinate
    #[arg(long, allow_hyphen_values = true)]
    pub x: f64,

    /// Y coordinate
    #[arg(long, allow_hyphen_values = true)]
    pub y: f64,

    /// Free-form payload carried in the `content` field
    #[arg(long)]
    pub content: Option<String>,

    /// Ingest channel to write to (default: from configuration)
    #[arg(long, value_name = "PATH")]
    pub channel: Option<PathBuf>,
}

/// One newline-terminated envelope line.
pub fn build_envelope(id: u32, x: f64, y: f64, content: Option<&str>) -> Result<String> {
    let mut envelope = json!({
        "sender_id": id,
        "pos": { "p": { "x": x, "y": y } },
    });
    if let Some(content) = content {
        envelope["content"] = json!(content);
    }
    let mut line = serde_json::to_string(&envelope).context("Failed to encode envelope")?;
    line.push('\n');
    Ok(line)
}

pub async fn execute(args: InjectArgs, config_override: Option<PathBuf>) -> Result<()> {
    let channel = match args.channel.clone() {
        Some(channel) => channel,
        None => BrokerConfigManifest::load_or_default(config_override)
            .context("Failed to load configuration")?
            .ingest_path(),
    };

    let line = build_envelope(args.id, args.x, args.y, args.content.as_deref())?;
    write_line(&channel, &line).await?;

    println!(
        "{}",
        format!("✓ Sent envelope from agent {} to {}", args.id, channel.display()).green()
    );
    Ok(())
}

#[cfg(unix)]
async fn write_line(channel: &std::path::Path, line: &str) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::unix::pipe;

    let mut sender = pipe::OpenOptions::new()
        .open_sender(channel)
        .with_context(|| {
            format!(
                "Failed to open {} for writing (is the broker running?)",
                channel.display()
            )
        })?;
    sender
        .write_all(line.as_bytes())
        .await
        .context("Failed to write envelope")?;
    Ok(())
}

#[cfg(not(unix))]
async fn write_line(_channel: &std::path::Path, _line: &str) -> Result<()> {
    anyhow::bail!("named pipes are only available on unix")
}
