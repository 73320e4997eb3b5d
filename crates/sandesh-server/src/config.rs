//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (SANDESH_*)
//! - TOML configuration file

use anyhow::{Context, Result};
use sandesh_core::DispatchConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

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

    /// Signaling timeouts.
    #[serde(default)]
    pub timeouts: TimeoutsConfig,

    /// Heartbeat configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of live connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum WebSocket message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum history page size.
    #[serde(default = "default_history_page_limit")]
    pub history_page_limit: u32,
}

/// Signaling timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    /// Live-transport application-ack timeout in milliseconds.
    #[serde(default = "default_transport_ack_ms")]
    pub transport_ack_ms: u64,

    /// Ring timeout in milliseconds.
    #[serde(default = "default_ring_ms")]
    pub ring_ms: u64,

    /// Post-accept handshake grace window in milliseconds.
    #[serde(default = "default_handshake_grace_ms")]
    pub handshake_grace_ms: u64,

    /// Terminal-session retention before sweeping, in milliseconds.
    #[serde(default = "default_terminal_retention_ms")]
    pub terminal_retention_ms: u64,
}

/// Heartbeat configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Connection timeout in milliseconds.
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_ms: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("SANDESH_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("SANDESH_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7400)
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_history_page_limit() -> u32 {
    200
}

fn default_transport_ack_ms() -> u64 {
    10_000
}

fn default_ring_ms() -> u64 {
    30_000
}

fn default_handshake_grace_ms() -> u64 {
    10_000
}

fn default_terminal_retention_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_heartbeat_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            timeouts: TimeoutsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
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
            max_connections: default_max_connections(),
            max_message_size: default_max_message_size(),
            history_page_limit: default_history_page_limit(),
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            transport_ack_ms: default_transport_ack_ms(),
            ring_ms: default_ring_ms(),
            handshake_grace_ms: default_handshake_grace_ms(),
            terminal_retention_ms: default_terminal_retention_ms(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            timeout_ms: default_heartbeat_timeout(),
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
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "sandesh.toml",
            "/etc/sandesh/sandesh.toml",
            "~/.config/sandesh/sandesh.toml",
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

    /// Get the socket address to bind to.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        format!("{}:{}", self.host, self.port)
            .parse()
            .expect("Invalid host:port")
    }

    /// Dispatcher timing configuration derived from the timeouts section.
    #[must_use]
    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            transport_ack_timeout: Duration::from_millis(self.timeouts.transport_ack_ms),
            ring_timeout: Duration::from_millis(self.timeouts.ring_ms),
            handshake_grace: Duration::from_millis(self.timeouts.handshake_grace_ms),
            terminal_retention: Duration::from_millis(self.timeouts.terminal_retention_ms),
        }
    }
}
