//! Configuration management
//!
//! Loads and validates gateway configuration from TOML files.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use crate::crypto::CipherMethod;
use crate::plugin;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub local: LocalConfig,
    pub server: RemoteConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Local SOCKS5 listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Address the SOCKS5 listener binds to
    #[serde(default = "default_listen_host")]
    pub listen_host: String,
    /// Port the SOCKS5 listener binds to (0 = ephemeral)
    pub listen_port: u16,
    /// Accept UDP ASSOCIATE requests (reply only; no datagram relay)
    #[serde(default)]
    pub udp: bool,
    /// Number of worker threads (0 = auto)
    #[serde(default)]
    pub workers: usize,
}

impl LocalConfig {
    /// Get effective worker count (auto-detect if 0)
    pub fn effective_workers(&self) -> usize {
        if self.workers == 0 {
            num_cpus::get()
        } else {
            self.workers
        }
    }

    /// Listener bind address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self
            .listen_host
            .parse()
            .with_context(|| format!("Invalid listen_host: {}", self.listen_host))?;
        Ok(SocketAddr::new(ip, self.listen_port))
    }
}

/// Remote SSR server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    /// SSR server hostname or IP
    pub remote_host: String,
    /// SSR server port
    pub remote_port: u16,
    /// Shared password
    pub password: String,
    /// Cipher method name
    #[serde(default = "default_method")]
    pub method: String,
    /// Protocol plugin name
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Protocol parameter string (e.g. "uid:key")
    #[serde(default)]
    pub protocol_param: String,
    /// Obfs plugin name
    #[serde(default = "default_obfs")]
    pub obfs: String,
    /// Obfs parameter string (e.g. fake Host list)
    #[serde(default)]
    pub obfs_param: String,
}

/// Timeout configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutsConfig {
    /// Idle timeout per tunnel in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
}

impl TimeoutsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics endpoint
    #[serde(default)]
    pub enabled: bool,
    /// Metrics server bind address
    #[serde(default = "default_metrics_addr")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: default_metrics_addr(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format: "json" or "pretty"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_listen_host() -> String { "127.0.0.1".to_string() }
fn default_method() -> String { "aes-128-ctr".to_string() }
fn default_protocol() -> String { "origin".to_string() }
fn default_obfs() -> String { "plain".to_string() }
fn default_idle_timeout_ms() -> u64 { 60_000 }
fn default_metrics_addr() -> SocketAddr { "127.0.0.1:9090".parse().unwrap() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config =
            toml::from_str(&contents).with_context(|| "Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        self.local.listen_addr()?;

        if self.server.remote_host.is_empty() {
            anyhow::bail!("remote_host must not be empty");
        }
        if self.server.remote_port == 0 {
            anyhow::bail!("remote_port must be > 0");
        }

        let method = CipherMethod::parse(&self.server.method)
            .ok_or_else(|| anyhow::anyhow!("Unknown cipher method: {}", self.server.method))?;
        if method.needs_contexts() && self.server.password.is_empty() {
            anyhow::bail!("password must not be empty for method {}", self.server.method);
        }

        if plugin::create_protocol(&self.server.protocol).is_none() {
            anyhow::bail!("Unknown protocol: {}", self.server.protocol);
        }
        if plugin::create_obfs(&self.server.obfs).is_none() {
            anyhow::bail!("Unknown obfs: {}", self.server.obfs);
        }

        if self.timeouts.idle_timeout_ms == 0 {
            anyhow::bail!("idle_timeout_ms must be > 0");
        }
        Ok(())
    }
}
