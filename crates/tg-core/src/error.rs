//! Core error types for ttygate

use std::path::PathBuf;
use std::time::Duration;

use tg_broker::BrokerError;
use thiserror::Error;

/// Top-level error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Credential backend error
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// SSH handshake did not complete
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Transport failed after the handshake
    #[error("Transport error: {0}")]
    Transport(String),

    /// Too many failed authentication attempts
    #[error("Authentication attempts exhausted after {attempts}")]
    AuthExhausted { attempts: u32 },

    /// Peer did not authenticate and open a channel in time
    #[error("Authentication timed out after {0:?}")]
    AuthTimedOut(Duration),

    /// The connection could not be moved into its own process
    #[error("Failed to isolate connection: {0}")]
    Isolation(String),
}

/// Session-related errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// A PTY was already allocated for this channel
    #[error("PTY already allocated")]
    PtyAlreadyAllocated,

    /// Operation needs a PTY but none was requested
    #[error("No PTY allocated")]
    NoPty,

    /// A child process is already running for this session
    #[error("Child process already running")]
    AlreadyRunning,

    /// Spawn requested without a token to pass on
    #[error("No token available for spawn")]
    MissingToken,

    /// The child process could not be started
    #[error("Failed to spawn child: {0}")]
    Spawn(String),

    /// Applying a window size failed
    #[error("PTY resize failed: {0}")]
    Resize(String),

    /// I/O error on the PTY
    #[error("PTY I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Whether this error ends the connection
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::PtyAllocation(_) | SessionError::Spawn(_))
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}
