//! Broker error types

use thiserror::Error;

/// Errors that can occur while talking to the credential backend
///
/// None of these are ever reported to the SSH peer; the gateway collapses
/// all of them into a uniform authentication denial.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Username is empty or longer than the protocol allows
    #[error("Invalid username: length {len} outside 1..={max}")]
    InvalidUsername { len: usize, max: usize },

    /// Password is empty or longer than the protocol allows
    #[error("Invalid password: length {len} outside 1..={max}")]
    InvalidPassword { len: usize, max: usize },

    /// The backend could not be reached
    #[error("Failed to connect to broker at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// The backend did not answer in time
    #[error("Broker did not respond within {0:?}")]
    Timeout(std::time::Duration),

    /// The response was not a token
    #[error("Malformed broker response: expected {expected} bytes, got {len}")]
    MalformedResponse { len: usize, expected: usize },

    /// The request could not be serialized
    #[error("Failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),

    /// I/O error during the exchange
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
