use std::env;
use std::sync::Arc;
use std::time::Duration;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

use crate::client::EventBusClient;
use crate::log::HttpLog;
use crate::policy::{
    DEFAULT_BATCH_LIMIT, DEFAULT_CHANNEL_CAPACITY, DEFAULT_READ_DELAY_FUZZ,
    DEFAULT_READ_DELAY_MEAN, DEFAULT_THROTTLE_COOLDOWN, ReadPolicy, ShardFailurePolicy,
};
use crate::runtime::Highlight;

pub const DEFAULT_STREAM: &str = "ema-event-stream";
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:4570";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShardFailureMode {
    #[default]
    Stop,
    Reconnect,
}

/// Event bus connection and read pacing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusSettings {
    #[serde(default = "default_stream")]
    pub stream: String,
    /// Base URL of the `ema-logd` service.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Publish only to the local log and consume nothing.
    #[serde(default)]
    pub offline: bool,
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    #[serde(default = "default_read_delay_mean_ms")]
    pub read_delay_mean_ms: u64,
    #[serde(default = "default_read_delay_fuzz_ms")]
    pub read_delay_fuzz_ms: u64,
    #[serde(default = "default_throttle_cooldown_ms")]
    pub throttle_cooldown_ms: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default)]
    pub shard_failure: ShardFailureMode,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_batch_limit() -> usize {
    DEFAULT_BATCH_LIMIT
}

fn default_read_delay_mean_ms() -> u64 {
    DEFAULT_READ_DELAY_MEAN.as_millis() as u64
}

fn default_read_delay_fuzz_ms() -> u64 {
    DEFAULT_READ_DELAY_FUZZ.as_millis() as u64
}

fn default_throttle_cooldown_ms() -> u64 {
    DEFAULT_THROTTLE_COOLDOWN.as_millis() as u64
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_reconnect_initial_ms() -> u64 {
    1000
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            endpoint: default_endpoint(),
            offline: false,
            batch_limit: default_batch_limit(),
            read_delay_mean_ms: default_read_delay_mean_ms(),
            read_delay_fuzz_ms: default_read_delay_fuzz_ms(),
            throttle_cooldown_ms: default_throttle_cooldown_ms(),
            channel_capacity: default_channel_capacity(),
            shard_failure: ShardFailureMode::Stop,
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl BusSettings {
    pub fn read_policy(&self) -> ReadPolicy {
        let on_failure = match self.shard_failure {
            ShardFailureMode::Stop => ShardFailurePolicy::Stop,
            ShardFailureMode::Reconnect => ShardFailurePolicy::Reconnect {
                initial_backoff: Duration::from_millis(self.reconnect_initial_ms),
                max_backoff: Duration::from_millis(self.reconnect_max_ms),
            },
        };

        ReadPolicy {
            batch_limit: self.batch_limit,
            read_delay_mean: Duration::from_millis(self.read_delay_mean_ms),
            read_delay_fuzz: Duration::from_millis(self.read_delay_fuzz_ms),
            throttle_cooldown: Duration::from_millis(self.throttle_cooldown_ms),
            channel_capacity: self.channel_capacity,
            on_failure,
        }
    }

    /// Build the bus client these settings describe.
    pub fn connect(&self) -> EventBusClient {
        if self.offline {
            EventBusClient::offline(&self.stream, self.read_policy())
        } else {
            EventBusClient::online(
                Arc::new(HttpLog::new(&self.endpoint)),
                &self.stream,
                self.read_policy(),
            )
        }
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.stream.is_empty() {
            return Err(SettingsError::Invalid {
                key: "bus.stream",
                reason: "must not be empty".into(),
            });
        }
        if self.batch_limit == 0 {
            return Err(SettingsError::Invalid {
                key: "bus.batch_limit",
                reason: "must be at least 1".into(),
            });
        }
        if self.channel_capacity == 0 {
            return Err(SettingsError::Invalid {
                key: "bus.channel_capacity",
                reason: "must be at least 1".into(),
            });
        }
        if self.reconnect_max_ms < self.reconnect_initial_ms {
            return Err(SettingsError::Invalid {
                key: "bus.reconnect_max_ms",
                reason: format!("must not be below {}", self.reconnect_initial_ms),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub bus: BusSettings,
    /// Same as `EMA_HIGHLIGHT_USER`.
    #[serde(default)]
    pub highlight_user: Option<String>,
    /// Same as `EMA_HIGHLIGHT_SESSION`.
    #[serde(default)]
    pub highlight_session: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self, SettingsError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with defaults
            .add_source(File::with_name("config/default").required(false))
            // Add environment-specific file
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add local configuration file (not tracked by git)
            .add_source(File::with_name("config/local").required(false))
            // EMA_BUS__STREAM -> bus.stream, EMA_HIGHLIGHT_USER -> highlight_user
            .add_source(
                Environment::with_prefix("EMA")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, SettingsError> {
        let settings: Self = builder.build()?.try_deserialize()?;
        settings.bus.validate()?;
        Ok(settings)
    }

    pub fn highlight(&self) -> Highlight {
        Highlight::new(self.highlight_user.clone(), self.highlight_session.clone())
    }
}
