//! Credential backend client
//!
//! Each authentication attempt opens a fresh TCP connection, sends one
//! request line and reads the backend's answer until it hangs up.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use zeroize::Zeroizing;

use crate::error::BrokerError;
use crate::message::{Credentials, Token, TOKEN_LEN};

/// Default backend address
pub const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1:8420";

/// Result of an authentication attempt as seen by the gateway
#[derive(Debug)]
pub enum AuthOutcome {
    /// Credentials accepted; the backend issued a token
    Granted(Token),
    /// Credentials rejected, or the backend could not vouch for them
    Denied,
}

impl AuthOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, AuthOutcome::Granted(_))
    }
}

/// Client for the credential backend
#[derive(Debug, Clone)]
pub struct BrokerClient {
    address: String,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl BrokerClient {
    /// Create a client with default timeouts
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(5),
        }
    }

    /// Override the connect and response timeouts
    pub fn with_timeouts(mut self, connect_timeout: Duration, response_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.response_timeout = response_timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Exchange validated credentials for a token.
    ///
    /// The write side is left open: the backend treats end-of-stream as a
    /// hang-up and would drop the connection before answering.
    pub async fn request_token(&self, credentials: &Credentials) -> Result<Token, BrokerError> {
        let line = credentials.request().encode_line()?;

        let mut stream =
            match tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(BrokerError::Connect {
                        address: self.address.clone(),
                        source,
                    })
                }
                Err(_) => return Err(BrokerError::Timeout(self.connect_timeout)),
            };
        stream.set_nodelay(true)?;

        let exchange = async {
            stream.write_all(&line).await?;
            stream.flush().await?;

            // One byte past a token is enough to tell an oversized reply apart
            let mut response = Zeroizing::new(Vec::with_capacity(TOKEN_LEN + 1));
            (&mut stream)
                .take((TOKEN_LEN + 1) as u64)
                .read_to_end(&mut response)
                .await?;
            Ok::<_, BrokerError>(response)
        };

        let response = tokio::time::timeout(self.response_timeout, exchange)
            .await
            .map_err(|_| BrokerError::Timeout(self.response_timeout))??;

        Token::from_response(&response)
    }

    /// Authenticate a username/password pair.
    ///
    /// Every failure, local or remote, is reported as [`AuthOutcome::Denied`];
    /// the cause is only logged.
    pub async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome {
        let credentials = match Credentials::new(username, password) {
            Ok(credentials) => credentials,
            Err(e) => {
                tracing::debug!("Rejecting credentials locally: {}", e);
                return AuthOutcome::Denied;
            }
        };

        match self.request_token(&credentials).await {
            Ok(token) => {
                tracing::debug!("Broker issued token for {}", credentials.username());
                AuthOutcome::Granted(token)
            }
            Err(e) => {
                tracing::debug!("Broker denied {}: {}", credentials.username(), e);
                AuthOutcome::Denied
            }
        }
    }
}

impl Default for BrokerClient {
    fn default() -> Self {
        Self::new(DEFAULT_BROKER_ADDRESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let client = BrokerClient::default();
        assert_eq!(client.address(), "127.0.0.1:8420");
        assert_eq!(client.connect_timeout, Duration::from_secs(5));
        assert_eq!(client.response_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_invalid_credentials_never_reach_backend() {
        let client = BrokerClient::new("127.0.0.1:1");
        assert!(!client.authenticate("", "pw").await.is_granted());
        assert!(!client.authenticate("alice", &"x".repeat(65)).await.is_granted());
    }

    #[tokio::test]
    async fn test_unreachable_backend_is_denied() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = BrokerClient::new(address);
        let creds = Credentials::new("alice", "hunter22").unwrap();
        assert!(matches!(
            client.request_token(&creds).await,
            Err(BrokerError::Connect { .. })
        ));
        assert!(!client.authenticate("alice", "hunter22").await.is_granted());
    }
}
