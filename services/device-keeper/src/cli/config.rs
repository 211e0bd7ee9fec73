//! Configuration module
//!
//! Handles loading and validating keeper configuration from TOML files.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::connection::backoff::BackoffPolicy;

/// Main configuration structure for the Device Keeper
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Discovery tick settings
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Per-connection socket settings
    #[serde(default)]
    pub connection: ConnectionConfig,

    /// Reconnect backoff settings
    #[serde(default)]
    pub retry: RetryConfig,

    /// Shared worker pool settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Device directory (registry) API
    #[serde(default)]
    pub directory: DirectoryConfig,

    /// Downstream device pool
    #[serde(default)]
    pub device_pool: DevicePoolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Discovery tick configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Delay between two directory queries in seconds
    #[serde(default = "default_discovery_interval")]
    pub interval_secs: u64,

    /// Upper bound for a single directory query in seconds
    #[serde(default = "default_timeout")]
    pub query_timeout_secs: u64,
}

/// Socket-level configuration shared by every connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// WebSocket handshake timeout in seconds
    #[serde(default = "default_timeout")]
    pub connect_timeout_secs: u64,

    /// Ping period in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,

    /// Bounded wait for a single ping in seconds
    #[serde(default = "default_timeout")]
    pub ping_timeout_secs: u64,

    /// Close status code an agent sends when the device went offline
    #[serde(default = "default_offline_close_code")]
    pub offline_close_code: u16,

    /// Close reason marker an agent sends when the device went offline
    #[serde(default = "default_offline_reason_marker")]
    pub offline_reason_marker: String,
}

/// Reconnect configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum reconnect attempts before giving up (0 = infinite)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff step in seconds
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,

    /// Backoff ceiling in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Attempt number after which the exponent stops growing
    #[serde(default = "default_cap_attempts")]
    pub cap_attempts: u32,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    /// Worker pool size; defaults to max(8, 2 x available cores)
    pub worker_threads: Option<usize>,
}

/// Device directory API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    /// Base URL of the control-plane REST API
    #[serde(default = "default_directory_url")]
    pub url: String,

    /// Bearer token for the directory API
    #[serde(default)]
    pub token: Option<String>,
}

/// Downstream device pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevicePoolConfig {
    /// Base URL of the device pool; empty disables downstream sync
    #[serde(default)]
    pub base_url: String,

    /// Static access token sent as `X-Access-Token`
    #[serde(default)]
    pub token: String,

    /// Prefix of the provider id reported for an agent host
    #[serde(default = "default_provider_prefix")]
    pub provider_prefix: String,

    /// Location label attached to registered devices
    #[serde(default = "default_location")]
    pub location: String,

    /// Group label attached to registered devices
    #[serde(default = "default_device_group")]
    pub device_group: String,

    /// Busy timeout reported to the pool in seconds
    #[serde(default = "default_busy_timeout")]
    pub busy_timeout_secs: u64,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json, compact)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_discovery_interval() -> u64 {
    5
}

fn default_timeout() -> u64 {
    10
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_offline_close_code() -> u16 {
    1001
}

fn default_offline_reason_marker() -> String {
    "DEVICE_OFFLINE".to_string()
}

fn default_max_attempts() -> u32 {
    10
}

fn default_base_delay() -> u64 {
    1
}

fn default_max_delay() -> u64 {
    30
}

fn default_cap_attempts() -> u32 {
    5
}

fn default_directory_url() -> String {
    "http://localhost:3000".to_string()
}

fn default_provider_prefix() -> String {
    "agent".to_string()
}

fn default_location() -> String {
    "lab".to_string()
}

fn default_device_group() -> String {
    "group_all".to_string()
}

fn default_busy_timeout() -> u64 {
    10800
}

fn default_request_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_discovery_interval(),
            query_timeout_secs: default_timeout(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            ping_timeout_secs: default_timeout(),
            offline_close_code: default_offline_close_code(),
            offline_reason_marker: default_offline_reason_marker(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay(),
            max_delay_secs: default_max_delay(),
            cap_attempts: default_cap_attempts(),
        }
    }
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: default_directory_url(),
            token: None,
        }
    }
}

impl Default for DevicePoolConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            provider_prefix: default_provider_prefix(),
            location: default_location(),
            device_group: default_device_group(),
            busy_timeout_secs: default_busy_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl ConnectionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_secs(self.ping_timeout_secs)
    }
}

impl RetryConfig {
    /// Backoff policy described by this section
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs),
            cap_attempts: self.cap_attempts,
        }
    }

    /// Retry budget, `None` meaning unlimited
    pub fn budget(&self) -> Option<u32> {
        (self.max_attempts > 0).then_some(self.max_attempts)
    }
}

impl SchedulerConfig {
    /// Effective pool size
    pub fn pool_size(&self) -> usize {
        self.worker_threads
            .filter(|n| *n > 0)
            .unwrap_or_else(crate::connection::scheduler::default_pool_size)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings that would stall or spin the keeper
    pub fn validate(&self) -> Result<()> {
        if self.discovery.interval_secs == 0 {
            bail!("discovery.interval_secs must be greater than zero");
        }
        if self.discovery.query_timeout_secs == 0 {
            bail!("discovery.query_timeout_secs must be greater than zero");
        }
        if self.connection.connect_timeout_secs == 0 {
            bail!("connection.connect_timeout_secs must be greater than zero");
        }
        if self.connection.heartbeat_interval_secs == 0 {
            bail!("connection.heartbeat_interval_secs must be greater than zero");
        }
        if self.connection.ping_timeout_secs == 0 {
            bail!("connection.ping_timeout_secs must be greater than zero");
        }
        if self.retry.base_delay_secs == 0 {
            bail!("retry.base_delay_secs must be greater than zero");
        }
        if self.retry.max_delay_secs < self.retry.base_delay_secs {
            bail!(
                "retry.max_delay_secs ({}) is smaller than retry.base_delay_secs ({})",
                self.retry.max_delay_secs,
                self.retry.base_delay_secs
            );
        }
        Ok(())
    }

    /// Serialize the effective configuration back to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }
}
