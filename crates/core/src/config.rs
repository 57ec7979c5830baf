//! Configuration for the signaling relay
//!
//! Configuration can be loaded from a TOML file and/or environment variables.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;

/// Main configuration for the signaling relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Routing and capacity settings
    #[serde(default)]
    pub relay: RelaySettings,

    /// Liveness settings
    #[serde(default)]
    pub keepalive: KeepaliveConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed to open a signaling socket (empty = any origin)
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

/// How an offer with no explicit callee finds its recipient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingPolicy {
    /// Offer goes to every idle peer; the first answer claims the pairing
    #[default]
    Broadcast,
    /// Offer names its callee in `target`
    Addressed,
}

impl RoutingPolicy {
    /// Check if this is broadcast routing
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::Broadcast)
    }

    /// Check if this is addressed routing
    pub fn is_addressed(&self) -> bool {
        matches!(self, Self::Addressed)
    }
}

impl fmt::Display for RoutingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Broadcast => f.write_str("broadcast"),
            Self::Addressed => f.write_str("addressed"),
        }
    }
}

impl FromStr for RoutingPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "broadcast" => Ok(Self::Broadcast),
            "addressed" => Ok(Self::Addressed),
            other => Err(Error::InvalidConfig(format!(
                "unknown routing policy '{}', expected 'broadcast' or 'addressed'",
                other
            ))),
        }
    }
}

/// Routing and capacity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    /// Offer routing policy
    #[serde(default)]
    pub routing_policy: RoutingPolicy,

    /// Maximum number of connected peers (0 = unlimited)
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,

    /// Per-peer outbound queue depth; overflow disconnects the peer
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Largest accepted inbound message in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

fn default_max_peers() -> usize {
    1000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_max_message_bytes() -> usize {
    64 * 1024
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            routing_policy: RoutingPolicy::default(),
            max_peers: default_max_peers(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

/// Liveness settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepaliveConfig {
    /// Interval between server pings in seconds
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Peers silent for longer than this are disconnected
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_ping_interval() -> u64 {
    20
}

fn default_idle_timeout() -> u64 {
    60
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> std::result::Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> std::result::Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`
    pub fn from_lookup<F>(lookup: F) -> std::result::Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RelayConfig::default();
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Load configuration from file if given, then overlay environment variables
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> std::result::Result<Self, ConfigError> {
        match path {
            Some(p) => {
                let mut config = Self::from_file(p)?;
                config.apply_env(|key| std::env::var(key).ok())?;
                Ok(config)
            }
            None => Self::from_env(),
        }
    }

    /// Overlay values looked up by environment variable name
    pub fn apply_env<F>(&mut self, lookup: F) -> std::result::Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("RELAY_HOST") {
            self.server.host = host;
        }
        if let Some(port) = lookup("PORT") {
            self.server.port = parse_env("PORT", &port)?;
        }
        if let Some(origins) = lookup("RELAY_ALLOWED_ORIGINS") {
            self.server.allowed_origins = origins
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(policy) = lookup("RELAY_ROUTING_POLICY") {
            self.relay.routing_policy = policy
                .parse()
                .map_err(|e: Error| ConfigError::Invalid(e.to_string()))?;
        }
        if let Some(max) = lookup("RELAY_MAX_PEERS") {
            self.relay.max_peers = parse_env("RELAY_MAX_PEERS", &max)?;
        }
        if let Some(depth) = lookup("RELAY_OUTBOUND_QUEUE") {
            self.relay.outbound_queue_capacity = parse_env("RELAY_OUTBOUND_QUEUE", &depth)?;
        }
        Ok(())
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;

        if self.relay.outbound_queue_capacity == 0 {
            return Err(Error::InvalidConfig(
                "outbound_queue_capacity must be at least 1".to_string(),
            ));
        }

        if self.relay.max_message_bytes < 1024 {
            return Err(Error::InvalidConfig(format!(
                "max_message_bytes must be at least 1024, got {}",
                self.relay.max_message_bytes
            )));
        }

        if self.keepalive.ping_interval_secs == 0 {
            return Err(Error::InvalidConfig(
                "ping_interval_secs must be at least 1".to_string(),
            ));
        }

        if self.keepalive.idle_timeout_secs <= self.keepalive.ping_interval_secs {
            return Err(Error::InvalidConfig(format!(
                "idle_timeout_secs ({}) must exceed ping_interval_secs ({})",
                self.keepalive.idle_timeout_secs, self.keepalive.ping_interval_secs
            )));
        }

        Ok(())
    }

    /// Socket address the server binds to
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .map_err(|e| {
                Error::InvalidConfig(format!(
                    "invalid listen address {}:{}: {}",
                    self.server.host, self.server.port, e
                ))
            })
    }

    /// Check an Origin header value against the allow-list
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if self.server.allowed_origins.is_empty() {
            return true;
        }
        match origin {
            Some(origin) => self
                .server
                .allowed_origins
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(origin)),
            None => false,
        }
    }
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> std::result::Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} has invalid value '{}'", key, value)))
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Invalid value: {0}")]
    Invalid(String),
}
