use std::env;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use ema_bus::config::DEFAULT_STREAM;
use ema_bus::log::MemoryLog;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogdSettings {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Stream created at startup.
    #[serde(default = "default_stream")]
    pub stream: String,
    #[serde(default = "default_shards")]
    pub shards: usize,
    /// Per-shard read limit; unlimited when absent.
    #[serde(default)]
    pub reads_per_second: Option<usize>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    4570
}

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

fn default_shards() -> usize {
    2
}

impl Default for LogdSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            stream: default_stream(),
            shards: default_shards(),
            reads_per_second: None,
        }
    }
}

impl LogdSettings {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .add_source(File::with_name("config/logd").required(false))
            .add_source(File::with_name(&format!("config/logd.{}", run_mode)).required(false))
            .add_source(File::with_name("config/logd.local").required(false))
            .add_source(
                Environment::with_prefix("EMA_LOGD")
                    .prefix_separator("_")
                    .try_parsing(true),
            );

        Self::from_builder(builder)
    }

    pub fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder.build()?.try_deserialize()
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The log these settings describe, with its stream already created.
    pub fn build_log(&self) -> MemoryLog {
        let log = MemoryLog::with_stream(&self.stream, self.shards);
        match self.reads_per_second {
            Some(limit) => log.with_read_limit(limit),
            None => log,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_defaults_and_overrides() {
        let defaults = LogdSettings::from_builder(
            Config::builder().add_source(File::from_str("", FileFormat::Toml)),
        )
        .unwrap();
        assert_eq!(defaults, LogdSettings::default());
        assert_eq!(defaults.addr(), "127.0.0.1:4570");

        let custom = LogdSettings::from_builder(Config::builder().add_source(File::from_str(
            "port = 9000\nshards = 8\nreads_per_second = 5",
            FileFormat::Toml,
        )))
        .unwrap();
        assert_eq!(custom.port, 9000);
        assert_eq!(custom.shards, 8);
        assert_eq!(custom.reads_per_second, Some(5));
    }
}
