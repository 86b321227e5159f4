// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Broker Configuration Types
//
// Kubernetes-style manifest (apiVersion/kind/metadata/spec) describing:
// - The ingest channel and fan-out concurrency bound
// - Per-agent channel naming, default range and write bounds
// - The companion process launched for each agent
// - Agents to register at startup
// - Logging and metrics settings

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const API_VERSION: &str = "proxcast.io/v1";
pub const KIND: &str = "BrokerConfig";

/// Top-level broker configuration manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfigManifest {
    /// API version (must be "proxcast.io/v1")
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    /// Resource kind (must be "BrokerConfig")
    pub kind: String,

    pub metadata: ManifestMetadata,

    pub spec: BrokerConfigSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestMetadata {
    /// Human-readable broker name
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrokerConfigSpec {
    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub agents: AgentsConfig,

    #[serde(default)]
    pub companion: CompanionConfig,

    /// Agents registered (asynchronously) as soon as the broker starts
    #[serde(default)]
    pub initial_agents: Vec<InitialAgent>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Path of the named pipe every companion writes its envelopes to
    #[serde(default = "default_ingest_channel")]
    pub channel: String,

    /// Upper bound on concurrently running fan-out workers
    #[serde(default = "default_max_inflight_workers")]
    pub max_inflight_workers: usize,

    /// Back-off after a read that returned no data, in milliseconds
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            channel: default_ingest_channel(),
            max_inflight_workers: default_max_inflight_workers(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// Directory holding per-agent named pipes (relative channel names resolve here)
    #[serde(default = "default_channel_dir")]
    pub channel_dir: String,

    /// Default channel name is `<channel_prefix><id>`
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,

    /// Broadcast range for agents without an explicit one
    #[serde(default = "default_range")]
    pub default_range: f64,

    /// How long agent creation waits for a reader on the new channel
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Upper bound on a single delivery
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            channel_dir: default_channel_dir(),
            channel_prefix: default_channel_prefix(),
            default_range: default_range(),
            connect_timeout_ms: default_connect_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionConfig {
    /// Launch a companion process per agent
    #[serde(default)]
    pub enabled: bool,

    /// Executable to run (looked up in PATH when not absolute)
    #[serde(default = "default_companion_program")]
    pub program: String,

    /// Argument vector; `{id}`, `{input}`, `{output}` and `{channel}` are
    /// substituted inside each element, never through a shell
    #[serde(default = "default_companion_args")]
    pub args: Vec<String>,

    /// Delay before spawning so the channel exists when the companion opens it
    #[serde(default = "default_spawn_delay_ms")]
    pub spawn_delay_ms: u64,

    /// Time a companion gets to exit on its own before it is killed
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            program: default_companion_program(),
            args: default_companion_args(),
            spawn_delay_ms: default_spawn_delay_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialAgent {
    pub id: u32,

    /// Channel name override (defaults to `<channel_prefix><id>`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    /// Range override (defaults to `agents.default_range`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (e.g., "info", "debug", "trace")
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format ("json" or "text")
    #[serde(default = "default_log_format")]
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus exporter port
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_true() -> bool {
    true
}

fn default_ingest_channel() -> String {
    "/tmp/proxcast-ingest".to_string()
}

fn default_max_inflight_workers() -> usize {
    64
}

fn default_idle_poll_ms() -> u64 {
    10
}

fn default_channel_dir() -> String {
    "/tmp".to_string()
}

fn default_channel_prefix() -> String {
    "proxcast-agent-".to_string()
}

fn default_range() -> f64 {
    crate::domain::agent::DEFAULT_RANGE
}

fn default_connect_timeout_ms() -> u64 {
    2000
}

fn default_write_timeout_ms() -> u64 {
    500
}

fn default_companion_program() -> String {
    "robot".to_string()
}

fn default_companion_args() -> Vec<String> {
    ["-i", "{input}", "-o", "{output}", "-n", "{id}"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_spawn_delay_ms() -> u64 {
    200
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for BrokerConfigManifest {
    fn default() -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "proxcast-broker".to_string());

        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            metadata: ManifestMetadata {
                name: hostname,
                version: Some("1.0.0".to_string()),
                labels: None,
            },
            spec: BrokerConfigSpec::default(),
        }
    }
}

impl IngestConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

impl AgentsConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl CompanionConfig {
    pub fn spawn_delay(&self) -> Duration {
        Duration::from_millis(self.spawn_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl BrokerConfigManifest {
    /// Load configuration from YAML file
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to YAML file
    pub fn to_yaml_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        std::fs::write(path, yaml)?;
        Ok(())
    }

    /// Parse configuration from YAML string
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Discover configuration file using precedence order
    /// 1. PROXCAST_CONFIG_PATH environment variable
    /// 2. ./proxcast-config.yaml (working directory)
    /// 3. ~/.proxcast/config.yaml (user home)
    /// 4. /etc/proxcast/config.yaml (system)
    pub fn discover_config() -> Option<PathBuf> {
        if let Ok(path) = std::env::var("PROXCAST_CONFIG_PATH") {
            let path = PathBuf::from(path);
            if path.exists() {
                return Some(path);
            }
        }

        let cwd = PathBuf::from("./proxcast-config.yaml");
        if cwd.exists() {
            return Some(cwd);
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".proxcast").join("config.yaml");
            if user_config.exists() {
                return Some(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/proxcast/config.yaml");
        if system_config.exists() {
            return Some(system_config);
        }

        None
    }

    /// Load configuration with discovery, fallback to default
    pub fn load_or_default(cli_path: Option<PathBuf>) -> anyhow::Result<Self> {
        // Explicit CLI path: fail if missing or invalid
        if let Some(path) = cli_path {
            tracing::info!("Loading configuration from explicit path: {:?}", path);
            let mut config = Self::from_yaml_file(&path)
                .map_err(|e| anyhow::anyhow!("Failed to load config at {:?}: {}", path, e))?;
            config.apply_env_overrides();
            return Ok(config);
        }

        if let Some(config_path) = Self::discover_config() {
            tracing::info!("Loading configuration from discovered path: {:?}", config_path);
            let mut config = Self::from_yaml_file(config_path)?;
            config.apply_env_overrides();
            Ok(config)
        } else {
            tracing::warn!("No configuration file found in standard locations. Using defaults.");
            let mut config = Self::default();
            config.apply_env_overrides();
            Ok(config)
        }
    }

    /// Apply environment variable overrides to configuration
    pub fn apply_env_overrides(&mut self) {
        if let Ok(channel) = std::env::var("PROXCAST_INGEST_CHANNEL") {
            if !channel.is_empty() {
                tracing::info!("Environment override: PROXCAST_INGEST_CHANNEL={}", channel);
                self.spec.ingest.channel = channel;
            }
        }

        if let Ok(val) = std::env::var("PROXCAST_COMPANION_ENABLED") {
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => {
                    tracing::info!("Environment override: PROXCAST_COMPANION_ENABLED=true");
                    self.spec.companion.enabled = true;
                }
                "false" | "0" | "no" | "off" => {
                    tracing::info!("Environment override: PROXCAST_COMPANION_ENABLED=false");
                    self.spec.companion.enabled = false;
                }
                _ => {
                    tracing::warn!(
                        "Invalid value for PROXCAST_COMPANION_ENABLED: '{}'. Expected true/false. Ignoring.",
                        val
                    );
                }
            }
        }

        if let Ok(val) = std::env::var("PROXCAST_MAX_INFLIGHT_WORKERS") {
            match val.parse::<usize>() {
                Ok(limit) => {
                    tracing::info!("Environment override: PROXCAST_MAX_INFLIGHT_WORKERS={}", limit);
                    self.spec.ingest.max_inflight_workers = limit;
                }
                Err(_) => {
                    tracing::warn!(
                        "Invalid value for PROXCAST_MAX_INFLIGHT_WORKERS: '{}'. Expected a positive integer. Ignoring.",
                        val
                    );
                }
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.api_version != API_VERSION {
            anyhow::bail!(
                "Invalid apiVersion: '{}'. Must be '{}'",
                self.api_version,
                API_VERSION
            );
        }

        if self.kind != KIND {
            anyhow::bail!("Invalid kind: '{}'. Must be '{}'", self.kind, KIND);
        }

        if self.metadata.name.is_empty() {
            anyhow::bail!("metadata.name cannot be empty");
        }

        if self.spec.ingest.channel.is_empty() {
            anyhow::bail!("spec.ingest.channel cannot be empty");
        }

        if self.spec.ingest.max_inflight_workers == 0 {
            anyhow::bail!("spec.ingest.max_inflight_workers must be at least 1");
        }

        if !is_valid_range(self.spec.agents.default_range) {
            anyhow::bail!(
                "spec.agents.default_range must be a positive finite number, got {}",
                self.spec.agents.default_range
            );
        }

        if self.spec.companion.enabled && self.spec.companion.program.is_empty() {
            anyhow::bail!("spec.companion.program cannot be empty when companions are enabled");
        }

        let mut seen = HashSet::new();
        for agent in &self.spec.initial_agents {
            if !seen.insert(agent.id) {
                anyhow::bail!("Duplicate initial agent id: {}", agent.id);
            }
            if let Some(range) = agent.range {
                if !is_valid_range(range) {
                    anyhow::bail!(
                        "Initial agent {} has invalid range {}: must be a positive finite number",
                        agent.id,
                        range
                    );
                }
            }
        }

        Ok(())
    }

    pub fn ingest_path(&self) -> PathBuf {
        PathBuf::from(&self.spec.ingest.channel)
    }

    pub fn log_level(&self) -> Option<&str> {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.logging.as_ref())
            .map(|l| l.level.as_str())
    }

    pub fn log_format(&self) -> &str {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.logging.as_ref())
            .map(|l| l.format.as_str())
            .unwrap_or("text")
    }

    /// Metrics exporter port, if metrics are switched on.
    pub fn metrics_port(&self) -> Option<u16> {
        self.spec
            .observability
            .as_ref()
            .and_then(|o| o.metrics.as_ref())
            .filter(|m| m.enabled)
            .map(|m| m.port)
    }
}

fn is_valid_range(range: f64) -> bool {
    range.is_finite() && range > 0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_manifest() {
        let manifest = BrokerConfigManifest::default();
        assert_eq!(manifest.api_version, "proxcast.io/v1");
        assert_eq!(manifest.kind, "BrokerConfig");
        assert!(!manifest.metadata.name.is_empty());
        assert_eq!(manifest.spec.agents.default_range, 10.0);
        assert!(!manifest.spec.companion.enabled);
        assert!(manifest.spec.initial_agents.is_empty());
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml_fills_defaults() {
        let yaml = r#"
apiVersion: proxcast.io/v1
kind: BrokerConfig
metadata:
  name: lab-broker
spec:
  ingest:
    channel: /tmp/simulIn
  companion:
    enabled: true
    program: /usr/local/bin/robot
  initial_agents:
    - id: 1
      channel: "Robot 1"
    - id: 2
      range: 25.5
  observability:
    logging:
      level: debug
      format: json
    metrics:
      port: 9100
"#;
        let manifest = BrokerConfigManifest::from_yaml_str(yaml).unwrap();
        assert_eq!(manifest.metadata.name, "lab-broker");
        assert_eq!(manifest.ingest_path(), PathBuf::from("/tmp/simulIn"));
        assert_eq!(manifest.spec.ingest.max_inflight_workers, 64);
        assert_eq!(manifest.spec.agents.channel_prefix, "proxcast-agent-");
        assert!(manifest.spec.companion.enabled);
        assert_eq!(manifest.spec.companion.args[1], "{input}");
        assert_eq!(manifest.spec.initial_agents.len(), 2);
        assert_eq!(manifest.spec.initial_agents[0].channel.as_deref(), Some("Robot 1"));
        assert_eq!(manifest.spec.initial_agents[1].range, Some(25.5));
        assert_eq!(manifest.log_level(), Some("debug"));
        assert_eq!(manifest.log_format(), "json");
        assert_eq!(manifest.metrics_port(), Some(9100));
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let mut manifest = BrokerConfigManifest::default();
        manifest.spec.initial_agents.push(InitialAgent {
            id: 3,
            channel: Some("robot3".to_string()),
            range: None,
        });

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let parsed = BrokerConfigManifest::from_yaml_str(&yaml).unwrap();

        assert_eq!(parsed.api_version, manifest.api_version);
        assert_eq!(parsed.spec.initial_agents, manifest.spec.initial_agents);
        assert_eq!(parsed.spec.companion.args, manifest.spec.companion.args);
    }

    #[test]
    fn test_validation() {
        let mut manifest = BrokerConfigManifest::default();
        assert!(manifest.validate().is_ok());

        manifest.api_version = "wrong/v1".to_string();
        assert!(manifest.validate().is_err());
        manifest.api_version = API_VERSION.to_string();

        manifest.kind = "NodeConfig".to_string();
        assert!(manifest.validate().is_err());
        manifest.kind = KIND.to_string();

        manifest.spec.ingest.max_inflight_workers = 0;
        assert!(manifest.validate().is_err());
        manifest.spec.ingest.max_inflight_workers = 8;

        manifest.spec.agents.default_range = f64::NAN;
        assert!(manifest.validate().is_err());
        manifest.spec.agents.default_range = 10.0;

        manifest.spec.companion.enabled = true;
        manifest.spec.companion.program = String::new();
        assert!(manifest.validate().is_err());
        manifest.spec.companion.enabled = false;

        manifest.spec.initial_agents = vec![
            InitialAgent { id: 1, channel: None, range: None },
            InitialAgent { id: 1, channel: None, range: None },
        ];
        assert!(manifest.validate().is_err());

        manifest.spec.initial_agents.pop();
        manifest.spec.initial_agents[0].range = Some(-1.0);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_metrics_disabled_by_default() {
        let manifest = BrokerConfigManifest::default();
        assert_eq!(manifest.metrics_port(), None);
        assert_eq!(manifest.log_format(), "text");
    }
}
