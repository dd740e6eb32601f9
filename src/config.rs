use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::engine::{CaptureConfig, EmitterConfig, EngineConfig, SinkConfig};
use crate::error::FlowError;
use crate::flow::FlowConfig;

/// Largest accepted `capture.burst_size`
pub const MAX_BURST_SIZE: usize = 65_536;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub flow: FlowConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub emitter: EmitterConfig,

    #[serde(default)]
    pub sink: SinkConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from default locations or create default
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/flowmeter/config.toml"),
            PathBuf::from("flowmeter.toml"),
        ];

        for path in &paths {
            if path.exists() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(&path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> std::result::Result<(), FlowError> {
        let invalid = |msg: &str| Err(FlowError::Config(msg.to_string()));

        if self.flow.table_capacity == 0 {
            return invalid("flow.table_capacity must be greater than 0");
        }
        if self.flow.shards > self.flow.table_capacity {
            return invalid("flow.table_capacity must be at least flow.shards");
        }
        if self.flow.idle_timeout_ms == 0 || self.flow.max_lifetime_ms == 0 {
            return invalid("flow timeouts must be greater than 0");
        }
        if self.flow.idle_timeout_ms > self.flow.max_lifetime_ms {
            return invalid("flow.idle_timeout_ms must not exceed flow.max_lifetime_ms");
        }
        if self.capture.burst_size == 0 || self.capture.burst_size > MAX_BURST_SIZE {
            return invalid("capture.burst_size must be between 1 and 65536");
        }
        if self.engine.expiry_interval_ms == 0 {
            return invalid("engine.expiry_interval_ms must be greater than 0");
        }
        if self.emitter.buffer_size == 0 {
            return invalid("emitter.buffer_size must be greater than 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LinkLayer;
    use crate::engine::{ClockSource, OverflowPolicy};

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.flow.idle_timeout_ms, 120_000);
        assert_eq!(config.capture.burst_size, 32);
        assert_eq!(config.engine.expiry_interval_ms, 1_000);
        assert_eq!(config.emitter.overflow, OverflowPolicy::DropOldest);
        assert_eq!(config.sink, SinkConfig::Stdout);
    }

    #[test]
    fn test_config_serialization() {
        let mut config = Config::default();
        config.sink = SinkConfig::File { path: PathBuf::from("/tmp/flows.jsonl") };
        config.capture.pcap_file = Some(PathBuf::from("trace.pcap"));

        let toml_str = config.to_toml_string().unwrap();
        let parsed = Config::from_toml_str(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_config() {
        let config = Config::from_toml_str(
            r#"
            [flow]
            idle_timeout_ms = 5000
            table_capacity = 1024

            [capture]
            link_layer = "raw_ip"

            [engine]
            clock = "packet"

            [emitter]
            overflow = "block"

            [sink]
            type = "null"
            "#,
        )
        .unwrap();

        assert_eq!(config.flow.idle_timeout_ms, 5_000);
        assert_eq!(config.flow.max_lifetime_ms, 3_600_000);
        assert_eq!(config.capture.link_layer, LinkLayer::RawIp);
        assert_eq!(config.engine.clock, ClockSource::Packet);
        assert_eq!(config.emitter.overflow, OverflowPolicy::Block);
        assert_eq!(config.emitter.block_timeout_ms, 50);
        assert_eq!(config.sink, SinkConfig::Null);
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.flow.idle_timeout_ms = config.flow.max_lifetime_ms + 1;
        assert!(matches!(config.validate(), Err(FlowError::Config(_))));

        let mut config = Config::default();
        config.flow.table_capacity = 4;
        config.flow.shards = 8;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.capture.burst_size = 0;
        assert!(config.validate().is_err());
        config.capture.burst_size = MAX_BURST_SIZE;
        assert!(config.validate().is_ok());
        config.capture.burst_size = MAX_BURST_SIZE + 1;
        assert!(config.validate().is_err());

        assert!(Config::from_toml_str("[engine]\nexpiry_interval_ms = 0\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flowmeter.toml");
        std::fs::write(&path, "[flow]\ntable_capacity = 2048\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.flow.table_capacity, 2048);

        let missing = Config::load(dir.path().join("missing.toml")).unwrap_err();
        assert!(format!("{:#}", missing).contains("Failed to read config file"));
    }
}
