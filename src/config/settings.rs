use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::ping::SupervisorConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub ping: PingConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    /// Supervisor tick in milliseconds; per-connection intervals are
    /// quantized to this resolution
    #[serde(default = "default_ping_tick_ms")]
    pub tick_ms: u64,
    /// Default per-connection ping interval in seconds when the caller
    /// enables pings without one
    #[serde(default = "default_ping_interval")]
    pub default_interval_secs: u64,
}

fn default_ping_tick_ms() -> u64 {
    1000
}

fn default_ping_interval() -> u64 {
    30 // 30 seconds
}

#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// Patience per recipient before a send counts as failed, in
    /// milliseconds
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

fn default_send_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct KvConfig {
    /// Expired-entry purge interval in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

fn default_purge_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Cap on retained queue-message descriptors per connection
    #[serde(default = "default_max_tracked_messages")]
    pub max_tracked_messages: usize,
}

fn default_max_tracked_messages() -> usize {
    1000
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("ping.tick_ms", default_ping_tick_ms())?
            .set_default("ping.default_interval_secs", default_ping_interval())?
            .set_default("broadcast.send_timeout_ms", default_send_timeout_ms())?
            .set_default("kv.purge_interval_secs", default_purge_interval())?
            .set_default(
                "queue.max_tracked_messages",
                default_max_tracked_messages() as u64,
            )?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // PING_TICK_MS, BROADCAST_SEND_TIMEOUT_MS, KV_PURGE_INTERVAL_SECS, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            tick: Duration::from_millis(self.ping.tick_ms),
            kv_purge_interval: Duration::from_secs(self.kv.purge_interval_secs),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.broadcast.send_timeout_ms)
    }

    pub fn default_ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping.default_interval_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ping: PingConfig::default(),
            broadcast: BroadcastConfig::default(),
            kv: KvConfig::default(),
            queue: QueueConfig::default(),
        }
    }
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_ping_tick_ms(),
            default_interval_secs: default_ping_interval(),
        }
    }
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            purge_interval_secs: default_purge_interval(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_tracked_messages: default_max_tracked_messages(),
        }
    }
}
