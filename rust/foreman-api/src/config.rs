//! Configuration loading for the Foreman API.
//!
//! Sources, in order: serde defaults, an optional `config/foreman` file
//! (yaml/toml/json), then `FOREMAN__`-prefixed environment variables. A few
//! well-known bare environment variables override on top.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub offline_queue: OfflineQueueConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

impl AppConfig {
    /// Load configuration from defaults, config file, and environment.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config/foreman").required(false))
            .add_source(
                config::Environment::with_prefix("FOREMAN")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut app_config: AppConfig = config.try_deserialize().unwrap_or_default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            app_config.database.url = Some(url);
        }
        if let Ok(token) = std::env::var("CHAT_BOT_TOKEN") {
            app_config.chat.token = Some(token);
        }

        app_config.validate()?;
        Ok(app_config)
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dispatch.heartbeat_interval_ms == 0 {
            anyhow::bail!("dispatch.heartbeat_interval_ms must be positive");
        }
        if self.dispatch.auth_timeout_ms == 0 {
            anyhow::bail!("dispatch.auth_timeout_ms must be positive");
        }
        if self.offline_queue.max_concurrent_deliveries == 0 {
            anyhow::bail!("offline_queue.max_concurrent_deliveries must be positive");
        }
        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit.max_requests must be positive");
        }
        Ok(())
    }
}

/// Bind address and transport policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Require TLS, either direct or via the forwarded-protocol header.
    #[serde(default)]
    pub require_secure_transport: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            require_secure_transport: false,
        }
    }
}

/// Worker-connection and continuation policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Ping cadence; the dead threshold is twice this.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Pre-auth window before the socket is closed.
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
    /// Auto-continue cap per task.
    #[serde(default = "default_max_continuations")]
    pub max_continuations: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
            max_continuations: default_max_continuations(),
        }
    }
}

impl DispatchConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Liveness threshold: two missed heartbeats.
    pub fn dead_threshold(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms * 2)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }
}

/// Offline delivery behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineQueueConfig {
    #[serde(default = "default_offline_ttl_ms")]
    pub ttl_ms: u64,
    #[serde(default = "default_max_concurrent_deliveries")]
    pub max_concurrent_deliveries: usize,
    /// Deliver one at a time, stopping at the first failure, when strict
    /// ordering is required.
    #[serde(default)]
    pub preserve_order: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,
}

impl Default for OfflineQueueConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_offline_ttl_ms(),
            max_concurrent_deliveries: default_max_concurrent_deliveries(),
            preserve_order: false,
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            delivery_timeout_ms: default_delivery_timeout_ms(),
            drain_interval_ms: default_drain_interval_ms(),
        }
    }
}

impl OfflineQueueConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.ttl_ms as i64)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Per-user command admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_rate_window_ms(),
            max_requests: default_max_requests(),
        }
    }
}

/// Terminal-task retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_task_retention_days")]
    pub task_retention_days: u32,
    #[serde(default = "default_archive_retention_days")]
    pub archive_retention_days: u32,
    #[serde(default = "default_retention_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            task_retention_days: default_task_retention_days(),
            archive_retention_days: default_archive_retention_days(),
            sweep_interval_ms: default_retention_sweep_interval_ms(),
        }
    }
}

/// Stream accumulator throttle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_edit_every_deltas")]
    pub edit_every_deltas: usize,
    #[serde(default = "default_edit_min_interval_ms")]
    pub edit_min_interval_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            edit_every_deltas: default_edit_every_deltas(),
            edit_min_interval_ms: default_edit_min_interval_ms(),
        }
    }
}

/// Database connection; absent means in-memory storage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: Option<String>,
}

/// Chat platform endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default = "default_chat_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: Option<String>,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            base_url: default_chat_base_url(),
            token: None,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8090
}
fn default_heartbeat_interval_ms() -> u64 {
    30_000
}
fn default_auth_timeout_ms() -> u64 {
    10_000
}
fn default_max_continuations() -> u32 {
    3
}
fn default_offline_ttl_ms() -> u64 {
    86_400_000
}
fn default_max_concurrent_deliveries() -> usize {
    5
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_delivery_timeout_ms() -> u64 {
    5_000
}
fn default_drain_interval_ms() -> u64 {
    30_000
}
fn default_rate_window_ms() -> u64 {
    60_000
}
fn default_max_requests() -> u32 {
    30
}
fn default_task_retention_days() -> u32 {
    30
}
fn default_archive_retention_days() -> u32 {
    90
}
fn default_retention_sweep_interval_ms() -> u64 {
    3_600_000
}
fn default_edit_every_deltas() -> usize {
    10
}
fn default_edit_min_interval_ms() -> u64 {
    1_500
}
fn default_chat_base_url() -> String {
    "https://slack.com/api".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatch.heartbeat_interval_ms, 30_000);
        assert_eq!(
            config.dispatch.dead_threshold(),
            Duration::from_millis(60_000)
        );
        assert_eq!(config.offline_queue.max_concurrent_deliveries, 5);
        assert!(!config.offline_queue.preserve_order);
    }

    #[test]
    fn test_validation_rejects_zero_heartbeat() {
        let mut config = AppConfig::default();
        config.dispatch.heartbeat_interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
