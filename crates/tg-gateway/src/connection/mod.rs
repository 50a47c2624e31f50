//! Connection handling
//!
//! Everything that runs inside one connection process: the state machine,
//! the russh handler, and the driver that owns the event loop.

mod driver;
mod handler;
pub mod machine;

pub use driver::{run_isolated, serve};
pub use handler::{server_config, GatewayHandler};

use std::sync::Arc;

use russh::ChannelId;
use russh_keys::key::KeyPair;
use tokio::sync::Mutex;

use tg_broker::Token;
use tg_core::config::{AuthConfig, ChildConfig, GatewayConfig, RelayConfig};
use tg_core::traits::Authenticator;

use crate::relay::{ChannelRelay, RelayRegistration};
use machine::{AbortReason, Action, AuthPolicy, ConnectionState, Event};

/// Everything a connection process needs, fixed at startup
#[derive(Clone)]
pub struct ConnectionContext {
    pub ssh_config: Arc<russh::server::Config>,
    pub authenticator: Arc<dyn Authenticator>,
    pub auth: AuthConfig,
    pub child: ChildConfig,
    pub relay: RelayConfig,
}

impl ConnectionContext {
    /// Build the context from the gateway configuration
    pub fn new(config: &GatewayConfig, host_key: KeyPair) -> Self {
        Self {
            ssh_config: Arc::new(server_config(host_key, &config.auth)),
            authenticator: Arc::new(config.broker.client()),
            auth: config.auth.clone(),
            child: config.child.clone(),
            relay: config.relay.clone(),
        }
    }
}

/// Result of authentication for this connection
///
/// The token stays here until the child is spawned, then it is gone.
#[derive(Debug, Default)]
pub struct AuthContext {
    username: Option<String>,
    token: Option<Token>,
}

impl AuthContext {
    /// Record a successful authentication
    pub fn grant(&mut self, username: &str, token: Token) {
        self.username = Some(username.to_string());
        self.token = Some(token);
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn has_token(&self) -> bool {
        self.token.is_some()
    }

    /// Hand out the token; a second call yields nothing
    pub fn take_token(&mut self) -> Option<Token> {
        self.token.take()
    }
}

/// Per-connection state shared by the handler and the driver
pub struct ConnectionSession {
    pub state: ConnectionState,
    pub auth: AuthContext,
    /// The one session channel, once accepted
    pub channel: Option<ChannelId>,
    pub relay: ChannelRelay,
}

impl ConnectionSession {
    pub fn new(policy: AuthPolicy, relay: ChannelRelay) -> Self {
        Self {
            state: ConnectionState::new(policy),
            auth: AuthContext::default(),
            channel: None,
            relay,
        }
    }

    /// Feed an event to the state machine
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        let actions = self.state.apply(event);
        tracing::trace!(
            "{:?} -> {:?} {:?}",
            event,
            self.state.phase(),
            actions
        );
        actions
    }
}

pub type SharedSession = Arc<Mutex<ConnectionSession>>;

/// Notifications from the handler to the driver
#[derive(Debug)]
pub enum Signal {
    /// Authenticated with a channel open; relaying begins
    RelayStarted,
    /// The application is running and its output must be monitored
    ChildStarted(RelayRegistration),
    /// The peer closed the session channel
    ChannelClosed,
    /// A PTY or spawn failure ended the session
    SessionFailed,
    Abort(AbortReason),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tg_broker::TOKEN_LEN;

    #[test]
    fn test_token_is_taken_once() {
        let mut auth = AuthContext::default();
        assert!(!auth.has_token());
        assert!(auth.take_token().is_none());

        let token = Token::from_response(&[b'a'; TOKEN_LEN]).unwrap();
        auth.grant("alice", token);
        assert_eq!(auth.username(), Some("alice"));
        assert!(auth.has_token());

        assert!(auth.take_token().is_some());
        assert!(auth.take_token().is_none());
        assert_eq!(auth.username(), Some("alice"));
    }

    #[test]
    fn test_session_starts_unauthenticated() {
        let session = ConnectionSession::new(
            AuthPolicy::default(),
            ChannelRelay::new(ChildConfig::default(), 1024),
        );
        assert_eq!(session.state.phase(), machine::Phase::PreAuth);
        assert!(session.channel.is_none());
        assert!(!session.auth.has_token());
    }
}
