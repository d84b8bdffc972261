//! Configuration management for curfew.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::fs_abstraction::{real_fs, FileSystem};
use crate::schedule::ScheduleWindow;
use crate::validation::{parse_time_of_day, validate_client_id, validate_protocol, validate_topic};

/// Default location of the YAML config file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/curfew/config.yaml";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker session settings
    pub broker: BrokerConfig,

    /// File listing the addresses affected by "block all" (one per line)
    pub targets_file: PathBuf,

    /// Daily blocking window
    pub schedule: ScheduleConfig,

    /// Shape of the packet-filter rules
    pub filter: FilterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            targets_file: PathBuf::from("/etc/curfew/target_ips.txt"),
            schedule: ScheduleConfig::default(),
            filter: FilterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = real_fs()
            .read_text(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config = Self::from_yaml(&content)
            .with_context(|| format!("Invalid config file: {:?}", path.as_ref()))?;
        Ok(config)
    }

    /// Load the config file if it exists, otherwise fall back to defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if real_fs().is_file(path.as_ref()) {
            Self::load(path)
        } else {
            tracing::debug!("No config file at {:?}, using defaults", path.as_ref());
            Ok(Self::default())
        }
    }

    /// Parse and validate YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(content).context("Failed to parse YAML configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.broker.validate()?;
        self.schedule.window()?;
        self.filter.validate()?;

        if self.targets_file.as_os_str().is_empty() {
            anyhow::bail!("targets_file must not be empty");
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Broker hostname (e.g. the AWS IoT custom endpoint)
    pub endpoint: String,
    pub port: u16,
    pub client_id: String,
    /// Command topic
    pub topic: String,
    /// Root CA certificate (PEM)
    pub ca_file: PathBuf,
    /// Client certificate (PEM)
    pub cert: PathBuf,
    /// Client private key (PEM)
    pub key: PathBuf,
    pub keep_alive_secs: u64,
    /// Ask the broker to keep session state across reconnects
    pub clean_session: bool,
    pub backoff: BackoffConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            port: 8883,
            client_id: "curfew-gateway".to_string(),
            topic: "block/device".to_string(),
            ca_file: PathBuf::from("/etc/curfew/certs/AmazonRootCA1.pem"),
            cert: PathBuf::from("/etc/curfew/certs/device.pem.crt"),
            key: PathBuf::from("/etc/curfew/certs/private.pem.key"),
            keep_alive_secs: 30,
            clean_session: false,
            backoff: BackoffConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        validate_topic(&self.topic)?;
        validate_client_id(&self.client_id)?;

        if self.port == 0 {
            anyhow::bail!("Broker port must not be 0");
        }
        if self.keep_alive_secs < 5 {
            anyhow::bail!(
                "keep_alive_secs must be at least 5 (got {})",
                self.keep_alive_secs
            );
        }
        self.backoff.validate()
    }

    /// Extra checks needed before opening a session.
    pub fn validate_for_connect(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            anyhow::bail!("Broker endpoint is not configured (use --endpoint or broker.endpoint)");
        }
        for (name, path) in [("ca_file", &self.ca_file), ("cert", &self.cert), ("key", &self.key)] {
            if path.as_os_str().is_empty() {
                anyhow::bail!("Broker {} path must not be empty", name);
            }
        }
        Ok(())
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

/// Reconnect backoff bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds
    pub initial_ms: u64,
    /// Upper bound for the retry delay in seconds
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_secs: 60,
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_ms == 0 {
            anyhow::bail!("backoff.initial_ms must be greater than 0");
        }
        if self.max_secs == 0 {
            anyhow::bail!("backoff.max_secs must be greater than 0");
        }
        if Duration::from_millis(self.initial_ms) > Duration::from_secs(self.max_secs) {
            anyhow::bail!("backoff.initial_ms must not exceed backoff.max_secs");
        }
        Ok(())
    }

    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    pub fn max(&self) -> Duration {
        Duration::from_secs(self.max_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Time to cut off access (24-hour "HH:MM")
    pub block_at: String,
    /// Time to restore access (24-hour "HH:MM")
    pub unblock_at: String,
    /// Refuse manual unblocks while the schedule is enabled and the
    /// window is active
    pub hold_during_window: bool,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            block_at: "00:00".to_string(),
            unblock_at: "06:00".to_string(),
            hold_during_window: false,
        }
    }
}

impl ScheduleConfig {
    /// Parse the configured times into a window.
    pub fn window(&self) -> Result<ScheduleWindow> {
        let block_at = parse_time_of_day(&self.block_at).context("Invalid schedule.block_at")?;
        let unblock_at =
            parse_time_of_day(&self.unblock_at).context("Invalid schedule.unblock_at")?;
        Ok(ScheduleWindow::new(block_at, unblock_at))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Chain the DROP rules are inserted into
    pub chain: String,
    /// Destination ports to drop (DNS by default)
    pub ports: Vec<u16>,
    /// Protocols to drop (udp, tcp)
    pub protocols: Vec<String>,
    /// Run iptables through sudo
    pub use_sudo: bool,
    pub iptables_path: String,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            chain: "INPUT".to_string(),
            ports: vec![53],
            protocols: vec!["udp".to_string(), "tcp".to_string()],
            use_sudo: false,
            iptables_path: "iptables".to_string(),
        }
    }
}

impl FilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.chain.is_empty() || self.chain.chars().any(|c| c.is_whitespace()) {
            anyhow::bail!("Invalid filter.chain '{}'", self.chain);
        }
        if self.ports.is_empty() {
            anyhow::bail!("filter.ports must list at least one port");
        }
        if self.ports.contains(&0) {
            anyhow::bail!("filter.ports must not contain 0");
        }
        if self.protocols.is_empty() {
            anyhow::bail!("filter.protocols must list at least one protocol");
        }
        for proto in &self.protocols {
            validate_protocol(proto)?;
        }
        if self.iptables_path.trim().is_empty() {
            anyhow::bail!("filter.iptables_path must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.broker.topic, "block/device");
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert!(!config.broker.clean_session);
        assert_eq!(config.filter.ports, vec![53]);
        assert!(!config.schedule.hold_during_window);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_window() {
        let window = Config::default().schedule.window().unwrap();
        assert_eq!(window.block_at(), NaiveTime::from_hms_opt(0, 0, 0).unwrap());
        assert_eq!(window.unblock_at(), NaiveTime::from_hms_opt(6, 0, 0).unwrap());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
broker:
  endpoint: "abc123-ats.iot.eu-west-2.amazonaws.com"
  client_id: "pi-gateway"
schedule:
  block_at: "21:30"
  unblock_at: "07:00"
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.broker.endpoint, "abc123-ats.iot.eu-west-2.amazonaws.com");
        assert_eq!(config.broker.client_id, "pi-gateway");
        assert_eq!(config.broker.topic, "block/device");
        assert_eq!(config.broker.port, 8883);
        assert_eq!(config.schedule.block_at, "21:30");
        assert_eq!(config.filter.chain, "INPUT");
        assert!(config.broker.validate_for_connect().is_ok());
    }

    #[test]
    fn test_invalid_schedule_time_rejected() {
        let yaml = "schedule:\n  block_at: \"25:00\"\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_invalid_protocol_rejected() {
        let yaml = "filter:\n  protocols: [\"icmp\"]\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_zero_port_rejected() {
        assert!(Config::from_yaml("broker:\n  port: 0\n").is_err());
        assert!(Config::from_yaml("filter:\n  ports: [53, 0]\n").is_err());
    }

    #[test]
    fn test_backoff_validation() {
        assert!(BackoffConfig::default().validate().is_ok());
        let zero = BackoffConfig {
            initial_ms: 0,
            max_secs: 60,
        };
        assert!(zero.validate().is_err());
        let inverted = BackoffConfig {
            initial_ms: 120_000,
            max_secs: 60,
        };
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_validate_for_connect_requires_endpoint() {
        let broker = BrokerConfig::default();
        assert!(broker.validate().is_ok());
        assert!(broker.validate_for_connect().is_err());
    }

    #[test]
    fn test_serialize_deserialize() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(parsed.targets_file, config.targets_file);
        assert_eq!(parsed.filter.protocols, config.filter.protocols);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default("/nonexistent/curfew/config.yaml").unwrap();
        assert_eq!(config.broker.topic, "block/device");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "targets_file: /tmp/targets.txt\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.targets_file, PathBuf::from("/tmp/targets.txt"));
    }
}
