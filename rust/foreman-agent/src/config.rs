//! Worker agent configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Agent configuration, loaded from an optional `config/foreman-agent` file
/// and `AGENT__`-prefixed environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Gateway websocket URL, e.g. `wss://foreman.example.com/api/v1/agents/ws`.
    pub gateway_url: String,
    /// Worker identity asserted at auth; must match the API key record.
    pub agent_id: String,
    pub api_key: String,
    /// Per-worker cap on concurrently executing tasks.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Command line the execution engine bridge spawns per task.
    #[serde(default)]
    pub engine_command: Option<String>,
    #[serde(default)]
    pub resources: ResourceThresholds,
    #[serde(default = "default_reconnect_base_ms")]
    pub reconnect_base_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

/// Admission and shutdown thresholds for host resources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceThresholds {
    /// Reject new tasks above this resident-memory percentage.
    #[serde(default = "default_max_memory_pct")]
    pub max_memory_pct: f64,
    /// Reject new tasks above this CPU-busy percentage.
    #[serde(default = "default_max_cpu_pct")]
    pub max_cpu_pct: f64,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            max_memory_pct: default_max_memory_pct(),
            max_cpu_pct: default_max_cpu_pct(),
            health_check_interval_ms: default_health_check_interval_ms(),
        }
    }
}

impl ResourceThresholds {
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }
}

impl AgentConfig {
    /// Load configuration from file and environment.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/foreman-agent").required(false))
            .add_source(
                config::Environment::with_prefix("AGENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let loaded: AgentConfig = config.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent_id.is_empty() {
            anyhow::bail!("agent_id must not be empty");
        }
        if self.api_key.is_empty() {
            anyhow::bail!("api_key must not be empty");
        }
        if self.max_concurrent == 0 {
            anyhow::bail!("max_concurrent must be at least 1");
        }
        Ok(())
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }
}

fn default_max_concurrent() -> usize {
    3
}
fn default_max_memory_pct() -> f64 {
    85.0
}
fn default_max_cpu_pct() -> f64 {
    90.0
}
fn default_health_check_interval_ms() -> u64 {
    15_000
}
fn default_reconnect_base_ms() -> u64 {
    1_000
}
fn default_reconnect_max_ms() -> u64 {
    60_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        let config = AgentConfig {
            gateway_url: "ws://localhost:8090/api/v1/agents/ws".into(),
            agent_id: "w1".into(),
            api_key: "fmk-1".into(),
            max_concurrent: 3,
            engine_command: None,
            resources: ResourceThresholds::default(),
            reconnect_base_ms: 1_000,
            reconnect_max_ms: 60_000,
        };
        assert!(config.validate().is_ok());

        let mut bad = config.clone();
        bad.agent_id = String::new();
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.max_concurrent = 0;
        assert!(bad.validate().is_err());
    }
}
