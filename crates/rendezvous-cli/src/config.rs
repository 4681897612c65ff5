//! Configuration system for the rendezvous server.

use rendezvous_broker::{IdConfig, ServerConfig};
use rendezvous_relay::{RelayConfig, RelayPorts};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Rendezvous configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// TCP control channel
    pub control: ControlConfig,
    /// UDP address registrar
    pub registrar: RegistrarConfig,
    /// Relay engine
    pub relay: RelaySection,
    /// Identifier lengths
    pub identity: IdentityConfig,
    /// Prometheus exporter
    pub metrics: MetricsConfig,
    /// Logging
    pub logging: LoggingConfig,
}

/// Control channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Listen address
    #[serde(default = "default_control_listen")]
    pub listen: String,
}

/// Registrar configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrarConfig {
    /// Listen address
    #[serde(default = "default_registrar_listen")]
    pub listen: String,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Local IP relay sockets bind to
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,
    /// Port range `start-end`, or `auto`
    #[serde(default = "default_ports")]
    pub ports: String,
    /// Live relay cap in `auto` mode
    #[serde(default = "default_max_slots")]
    pub max_slots: usize,
    /// Sliding relay expiry
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    /// Sweep period
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Receive buffer per relay port
    #[serde(default = "default_max_datagram_size")]
    pub max_datagram_size: usize,
}

/// Identifier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Public id length
    #[serde(default = "default_oid_length")]
    pub oid_length: usize,
    /// Private id length
    #[serde(default = "default_pid_length")]
    pub pid_length: usize,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    /// Prometheus scrape address, disabled when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_control_listen() -> String {
    "0.0.0.0:8890".to_string()
}

fn default_registrar_listen() -> String {
    "0.0.0.0:8809".to_string()
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_ports() -> String {
    RelayPorts::default().to_string()
}

fn default_max_slots() -> usize {
    2048
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    30
}

fn default_max_datagram_size() -> usize {
    65535
}

fn default_oid_length() -> usize {
    IdConfig::default().oid_length
}

fn default_pid_length() -> usize {
    IdConfig::default().pid_length
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            listen: default_control_listen(),
        }
    }
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            listen: default_registrar_listen(),
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            ports: default_ports(),
            max_slots: default_max_slots(),
            ttl_secs: default_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_datagram_size: default_max_datagram_size(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            oid_length: default_oid_length(),
            pid_length: default_pid_length(),
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

const ID_LENGTHS: std::ops::RangeInclusive<usize> = 8..=256;

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("rendezvous/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Relay port source
    ///
    /// # Errors
    ///
    /// Returns an error if `relay.ports` is neither a range nor `auto`.
    pub fn relay_ports(&self) -> anyhow::Result<RelayPorts> {
        let ports: RelayPorts = self.relay.ports.parse()?;
        Ok(match ports {
            RelayPorts::Auto { .. } => RelayPorts::Auto {
                max_slots: self.relay.max_slots,
            },
            range => range,
        })
    }

    /// Metrics exporter address, if enabled
    ///
    /// # Errors
    ///
    /// Returns an error if `metrics.listen` cannot be parsed.
    pub fn metrics_addr(&self) -> anyhow::Result<Option<SocketAddr>> {
        self.metrics
            .listen
            .as_deref()
            .map(|addr| parse_addr(addr, "metrics.listen"))
            .transpose()
    }

    /// Typed server configuration
    ///
    /// # Errors
    ///
    /// Returns an error if any address or the port range is malformed.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let bind_ip: IpAddr = self.relay.bind_ip.parse().map_err(|_| {
            anyhow::anyhow!("Invalid relay.bind_ip: {}", self.relay.bind_ip)
        })?;

        Ok(ServerConfig {
            control_addr: parse_addr(&self.control.listen, "control.listen")?,
            registrar_addr: parse_addr(&self.registrar.listen, "registrar.listen")?,
            relay: RelayConfig {
                bind_ip,
                ports: self.relay_ports()?,
                ttl: Duration::from_secs(self.relay.ttl_secs),
                sweep_interval: Duration::from_secs(self.relay.sweep_interval_secs),
                max_datagram_size: self.relay.max_datagram_size,
            },
            ids: IdConfig {
                oid_length: self.identity.oid_length,
                pid_length: self.identity.pid_length,
            },
        })
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server_config()?;
        self.metrics_addr()?;

        if self.relay.ttl_secs == 0 {
            anyhow::bail!("relay.ttl_secs must be greater than 0");
        }
        if self.relay.sweep_interval_secs == 0 {
            anyhow::bail!("relay.sweep_interval_secs must be greater than 0");
        }
        if self.relay.max_slots == 0 {
            anyhow::bail!("relay.max_slots must be greater than 0");
        }
        if self.relay.max_datagram_size == 0 || self.relay.max_datagram_size > 65535 {
            anyhow::bail!("relay.max_datagram_size must be between 1 and 65535");
        }

        for (name, length) in [
            ("identity.oid_length", self.identity.oid_length),
            ("identity.pid_length", self.identity.pid_length),
        ] {
            if !ID_LENGTHS.contains(&length) {
                anyhow::bail!(
                    "{name} must be between {} and {}",
                    ID_LENGTHS.start(),
                    ID_LENGTHS.end()
                );
            }
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

fn parse_addr(addr: &str, name: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .map_err(|_| anyhow::anyhow!("Invalid {name}: '{addr}' (expected ip:port)"))
}
