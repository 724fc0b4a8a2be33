//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (RELAY_*)
//! - TOML configuration file
//! - Command line arguments (`--config`)

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tenvis_relay_core::{HubConfig, RateLimitConfig, SessionConfig};

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Outbound messages buffered per client before it is dropped.
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Hub command queue capacity.
    #[serde(default = "default_hub_command_capacity")]
    pub hub_command_capacity: usize,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Keepalive ping interval in milliseconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    /// Time without a pong before a connection is dropped, in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// Longest a single write to a client may take, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Requests allowed per client IP per window.
    #[serde(default = "default_rate_limit")]
    pub requests: usize,

    /// Window length in seconds.
    #[serde(default = "default_rate_window")]
    pub window_secs: u64,

    /// Interval between sweeps of idle clients, in seconds.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prometheus exporter port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    env_or("RELAY_PORT", 8080)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    relay_protocol::MAX_FRAME_SIZE
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_hub_command_capacity() -> usize {
    1024
}

fn default_ping_interval() -> u64 {
    54_000 // 54 seconds
}

fn default_idle_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_write_timeout() -> u64 {
    10_000 // 10 seconds
}

fn default_rate_limit() -> usize {
    env_or("RELAY_RATE_LIMIT", 100)
}

fn default_rate_window() -> u64 {
    env_or("RELAY_RATE_WINDOW_SECS", 60)
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            rate_limit: RateLimitSettings::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            hub_command_capacity: default_hub_command_capacity(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval(),
            idle_timeout_ms: default_idle_timeout(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            requests: default_rate_limit(),
            window_secs: default_rate_window(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        // Try to load from default paths
        let config_paths = [
            "relay.toml",
            "/etc/relay/relay.toml",
            "~/.config/relay/relay.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Check that the settings can work together.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first inconsistent setting.
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;

        if self.heartbeat.ping_interval_ms >= self.heartbeat.idle_timeout_ms {
            bail!(
                "heartbeat.ping_interval_ms ({}) must be below heartbeat.idle_timeout_ms ({})",
                self.heartbeat.ping_interval_ms,
                self.heartbeat.idle_timeout_ms
            );
        }
        if self.heartbeat.write_timeout_ms == 0 {
            bail!("heartbeat.write_timeout_ms must be positive");
        }
        if self.rate_limit.window_secs == 0 {
            bail!("rate_limit.window_secs must be positive");
        }
        if self.rate_limit.cleanup_interval_secs == 0 {
            bail!("rate_limit.cleanup_interval_secs must be positive");
        }
        if !self.transport.websocket_path.starts_with('/') {
            bail!(
                "transport.websocket_path must start with '/': {}",
                self.transport.websocket_path
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid host:port {}:{}", self.host, self.port))
    }

    /// Settings for each client session.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            max_frame_size: self.limits.max_message_size,
            queue_capacity: self.limits.outbound_queue_capacity,
            ping_interval: Duration::from_millis(self.heartbeat.ping_interval_ms),
            idle_timeout: Duration::from_millis(self.heartbeat.idle_timeout_ms),
            write_timeout: Duration::from_millis(self.heartbeat.write_timeout_ms),
        }
    }

    /// Settings for the hub.
    #[must_use]
    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            command_capacity: self.limits.hub_command_capacity,
        }
    }

    /// Settings for the request rate limiter.
    #[must_use]
    pub fn rate_limit_config(&self) -> RateLimitConfig {
        RateLimitConfig {
            limit: self.rate_limit.requests,
            window: Duration::from_secs(self.rate_limit.window_secs),
        }
    }

    /// Interval between rate limiter sweeps.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.cleanup_interval_secs)
    }
}
