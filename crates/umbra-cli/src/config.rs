//! Configuration system for the umbra CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use umbra_relay::ProxyConfig;

/// Largest demo overlay
const MAX_DEMO_RELAYS: usize = 16;

/// umbra configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Relay layer configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Port of the relay service endpoint
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Port of the direct endpoint
    #[serde(default = "default_direct_port")]
    pub direct_port: u16,
    /// Relay nodes started by `umbra demo`
    #[serde(default = "default_demo_relays")]
    pub demo_relays: usize,
    /// Topic the demo announces under
    #[serde(default = "default_topic")]
    pub topic: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_relay_port() -> u16 {
    6881
}

fn default_direct_port() -> u16 {
    6882
}

fn default_demo_relays() -> usize {
    2
}

fn default_topic() -> String {
    "umbra-demo".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            relay_port: default_relay_port(),
            direct_port: default_direct_port(),
            demo_relays: default_demo_relays(),
            topic: default_topic(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).map_err(|e| {
            anyhow::anyhow!("Failed to read {}: {e}", path.as_ref().display())
        })?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from `path` if given, otherwise use the defaults
    ///
    /// # Errors
    ///
    /// Returns an error if the given file cannot be loaded.
    pub fn load_or_default(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Render as TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.proxy.validate()?;

        if self.node.relay_port == 0 || self.node.direct_port == 0 {
            anyhow::bail!("Node ports must be non-zero");
        }
        if self.node.relay_port == self.node.direct_port {
            anyhow::bail!(
                "Relay port and direct port must differ (both {})",
                self.node.relay_port
            );
        }

        if self.node.demo_relays == 0 || self.node.demo_relays > MAX_DEMO_RELAYS {
            anyhow::bail!("Demo relays must be between 1 and {MAX_DEMO_RELAYS}");
        }
        if self.node.topic.is_empty() {
            anyhow::bail!("Demo topic must not be empty");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.relay_port, 6881);
        assert_eq!(config.node.demo_relays, 2);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.proxy, ProxyConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.node.direct_port = config.node.relay_port;
        assert!(config.validate().is_err());

        config.node.direct_port = 6882;
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        assert!(config.validate().is_ok());

        config.proxy.keepalive_interval = config.proxy.idle_timeout;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.proxy, deserialized.proxy);
        assert_eq!(config.node.topic, deserialized.node.topic);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            server_enabled = false
            tick_interval = 5

            [node]
            demo_relays = 3
            "#,
        )
        .unwrap();

        assert!(!config.proxy.server_enabled);
        assert_eq!(config.proxy.tick_interval, Duration::from_secs(5));
        assert_eq!(config.proxy.max_server_proxies, 4);
        assert_eq!(config.node.demo_relays, 3);
        assert_eq!(config.node.relay_port, 6881);
        assert_eq!(config.logging.level, "info");
    }
}
