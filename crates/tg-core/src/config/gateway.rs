//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tg_broker::BrokerClient;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Path to the host key file
    pub host_key_path: PathBuf,

    /// Credential backend
    pub broker: BrokerConfig,

    /// Pre-relay gate policy
    pub auth: AuthConfig,

    /// Application launched for each authenticated session
    pub child: ChildConfig,

    /// Relay and teardown tuning
    pub relay: RelayConfig,

    /// How often the supervisor collects exited connection processes
    #[serde(rename = "reap_interval_ms", with = "duration_millis")]
    pub reap_interval: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:3333".to_string(),
            host_key_path: PathBuf::from("keys/host_ed25519"),
            broker: BrokerConfig::default(),
            auth: AuthConfig::default(),
            child: ChildConfig::default(),
            relay: RelayConfig::default(),
            reap_interval: Duration::from_millis(250),
        }
    }
}

impl GatewayConfig {
    /// Load the configuration.
    ///
    /// An explicit path must exist. Without one, the default location is
    /// tried and a missing file yields the compiled-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => super::load_config(path),
            None => match super::load_config(&super::default_config_path()) {
                Err(ConfigError::NotFound(path)) => {
                    tracing::debug!("No config at {}, using defaults", path.display());
                    Ok(Self::default())
                }
                other => other,
            },
        }
    }

    /// Reject settings the gateway cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_address.parse::<SocketAddr>().map_err(|e| {
            ConfigError::Invalid(format!("bind_address '{}': {}", self.bind_address, e))
        })?;

        if self.broker.address.is_empty() {
            return Err(ConfigError::Invalid("broker.address is empty".into()));
        }
        if self.auth.max_attempts == 0 {
            return Err(ConfigError::Invalid("auth.max_attempts must be at least 1".into()));
        }
        if self.auth.timeout.is_zero() {
            return Err(ConfigError::Invalid("auth.timeout must be non-zero".into()));
        }
        if self.auth.poll_interval.is_zero() {
            return Err(ConfigError::Invalid("auth.poll_interval_ms must be non-zero".into()));
        }
        if self.child.program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("child.program is empty".into()));
        }
        if self.relay.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("relay.read_buffer_size must be non-zero".into()));
        }
        if self.relay.close_poll_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "relay.close_poll_interval_ms must be non-zero".into(),
            ));
        }
        if self.reap_interval.is_zero() {
            return Err(ConfigError::Invalid("reap_interval_ms must be non-zero".into()));
        }

        Ok(())
    }
}

/// Credential backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: String,

    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub response_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: tg_broker::DEFAULT_BROKER_ADDRESS.to_string(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    /// Build a client for this backend
    pub fn client(&self) -> BrokerClient {
        BrokerClient::new(self.address.clone())
            .with_timeouts(self.connect_timeout, self.response_timeout)
    }
}

/// Limits on the unauthenticated phase of a connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Failed password attempts before the connection is dropped
    pub max_attempts: u32,

    /// Wall-clock budget for authenticating and opening a channel
    #[serde(with = "duration_secs")]
    pub timeout: Duration,

    /// Gate loop tick
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// The interactive application started for an authenticated user
///
/// The user's token is appended after `args`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChildConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl Default for ChildConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/bin/node"),
            args: vec!["bbs.js".to_string()],
            working_dir: None,
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        }
    }
}

/// Relay and teardown settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Upper bound on a single read from the child
    pub read_buffer_size: usize,

    /// How long to wait for the peer to acknowledge channel close
    #[serde(with = "duration_secs")]
    pub close_timeout: Duration,

    #[serde(rename = "close_poll_interval_ms", with = "duration_millis")]
    pub close_poll_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 1024 * 1024,
            close_timeout: Duration::from_secs(5),
            close_poll_interval: Duration::from_millis(100),
        }
    }
}
