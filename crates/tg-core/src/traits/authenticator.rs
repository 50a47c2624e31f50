//! Authentication seam

use async_trait::async_trait;
use tg_broker::{AuthOutcome, BrokerClient};

/// Decides password authentication attempts for the gateway
///
/// Implementations must not distinguish failure causes in their outcome;
/// anything that is not a token is a denial.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Check a username/password pair, yielding a token on success
    async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome;
}

#[async_trait]
impl Authenticator for BrokerClient {
    async fn authenticate(&self, username: &str, password: &str) -> AuthOutcome {
        BrokerClient::authenticate(self, username, password).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_broker_client_as_trait_object() {
        let auth: Arc<dyn Authenticator> = Arc::new(BrokerClient::new("127.0.0.1:1"));
        assert!(!auth.authenticate("", "").await.is_granted());
    }
}
