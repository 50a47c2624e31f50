//! SSH handler implementation
//!
//! Implements the russh server handler for one gateway connection. Every
//! request is turned into a state machine event; side effects that outlive
//! the callback are signalled to the driver.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet};
use russh_keys::key::{KeyPair, PublicKey};
use tokio::sync::mpsc;

use tg_broker::AuthOutcome;
use tg_core::config::AuthConfig;
use tg_core::error::SessionError;
use tg_core::traits::Authenticator;
use tg_core::TerminalSize;

use super::machine::{Action, Event};
use super::{SharedSession, Signal};
use crate::relay::StartOutcome;

/// Handler for a single SSH connection
pub struct GatewayHandler {
    session: SharedSession,
    authenticator: Arc<dyn Authenticator>,
    signals: mpsc::Sender<Signal>,
    peer_addr: SocketAddr,
}

impl GatewayHandler {
    pub fn new(
        session: SharedSession,
        authenticator: Arc<dyn Authenticator>,
        signals: mpsc::Sender<Signal>,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            session,
            authenticator,
            signals,
            peer_addr,
        }
    }

    async fn notify(&self, signal: Signal) {
        if self.signals.send(signal).await.is_err() {
            tracing::debug!("Driver gone, dropping signal");
        }
    }

    /// Forward the actions the driver has to carry out
    async fn dispatch(&self, actions: &[Action]) {
        for action in actions {
            match action {
                Action::StartRelay => self.notify(Signal::RelayStarted).await,
                Action::Abort(reason) => self.notify(Signal::Abort(*reason)).await,
                _ => {}
            }
        }
    }

    async fn fail_session(&self, channel: ChannelId, error: &SessionError, session: &mut Session) {
        session.channel_failure(channel);
        if error.is_fatal() {
            tracing::error!("Session for {} failed: {}", self.peer_addr, error);
            self.notify(Signal::SessionFailed).await;
        } else {
            tracing::debug!("Request refused: {}", error);
        }
    }

    async fn is_our_channel(&self, channel: ChannelId) -> bool {
        self.session.lock().await.channel == Some(channel)
    }

    /// Shell and exec both start the fixed application
    async fn start_child(&mut self, channel: ChannelId, session: &mut Session) {
        if !self.is_our_channel(channel).await {
            session.channel_failure(channel);
            return;
        }

        let outcome = {
            let mut guard = self.session.lock().await;
            let conn = &mut *guard;
            conn.relay.start(&mut conn.auth)
        };

        match outcome {
            Ok(StartOutcome::Spawned(registration)) => {
                session.channel_success(channel);
                self.notify(Signal::ChildStarted(registration)).await;
            }
            Ok(StartOutcome::NoTerminal) => {
                tracing::debug!("Start requested without a PTY; nothing spawned");
                session.channel_success(channel);
            }
            Ok(StartOutcome::AlreadyRunning) => {
                tracing::debug!("Rejecting second start request");
                session.channel_failure(channel);
            }
            Err(e) => self.fail_session(channel, &e, session).await,
        }
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    type Error = anyhow::Error;

    async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::Reject {
            proceed_with_methods: Some(MethodSet::PASSWORD),
        })
    }

    /// Handle password authentication
    ///
    /// The backend call runs without holding the session lock so the gate
    /// timer keeps running while it is in flight.
    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        tracing::info!("Password attempt for {} from {}", user, self.peer_addr);

        let outcome = self.authenticator.authenticate(user, password).await;

        let actions = {
            let mut conn = self.session.lock().await;
            match outcome {
                AuthOutcome::Granted(token) => {
                    let actions = conn.apply(Event::AuthAccepted);
                    if actions.contains(&Action::AcceptAuth) {
                        conn.auth.grant(user, token);
                    }
                    actions
                }
                AuthOutcome::Denied => conn.apply(Event::AuthRejected),
            }
        };
        self.dispatch(&actions).await;

        if actions.contains(&Action::AcceptAuth) {
            tracing::info!("Authenticated {} from {}", user, self.peer_addr);
            Ok(Auth::Accept)
        } else {
            tracing::info!("Authentication denied for {} from {}", user, self.peer_addr);
            // Keep offering passwords until the gate gives up
            let exhausted = actions.iter().any(|a| matches!(a, Action::Abort(_)));
            Ok(Auth::Reject {
                proceed_with_methods: (!exhausted).then_some(MethodSet::PASSWORD),
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();

        let actions = {
            let mut conn = self.session.lock().await;
            let actions = conn.apply(Event::ChannelOpened);
            if actions.contains(&Action::AcceptChannel) {
                conn.channel = Some(channel_id);
            }
            actions
        };
        self.dispatch(&actions).await;

        let accepted = actions.contains(&Action::AcceptChannel);
        tracing::debug!("Channel {:?} open request, accepted={}", channel_id, accepted);
        Ok(accepted)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_our_channel(channel).await {
            session.channel_failure(channel);
            return Ok(());
        }

        let size = TerminalSize::from_request(col_width, row_height, pix_width, pix_height);
        tracing::debug!("PTY request: term={} size={}", term, size);

        let result = self.session.lock().await.relay.allocate_pty(size);
        match result {
            Ok(()) => session.channel_success(channel),
            Err(e) => self.fail_session(channel, &e, session).await,
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.is_our_channel(channel).await {
            return Ok(());
        }

        let size = TerminalSize::from_request(col_width, row_height, pix_width, pix_height);
        if let Err(e) = self.session.lock().await.relay.resize(size) {
            tracing::debug!("Window change to {} not applied: {}", size, e);
        }
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.start_child(channel, session).await;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Exec request ({} bytes of command ignored)", data.len());
        self.start_child(channel, session).await;
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut conn = self.session.lock().await;
        if conn.channel != Some(channel) {
            return Ok(());
        }

        if let Err(e) = conn.relay.write_input(data) {
            tracing::debug!("Dropped {} bytes of input: {}", data.len(), e);
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        if self.is_our_channel(channel).await {
            self.notify(Signal::ChannelClosed).await;
        }
        Ok(())
    }
}

/// Build the russh server configuration
pub fn server_config(host_key: KeyPair, auth: &AuthConfig) -> russh::server::Config {
    let mut config = russh::server::Config::default();
    config.keys.push(host_key);
    config.methods = MethodSet::PASSWORD;
    config.max_auth_attempts = auth.max_attempts as usize;
    config.auth_rejection_time = Duration::from_secs(1);
    config.auth_rejection_time_initial = Some(Duration::from_secs(0));
    // Relays stay up however long the session is idle
    config.inactivity_timeout = None;
    config
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_offers_password_only() {
        let key = KeyPair::generate_ed25519().unwrap();
        let config = server_config(key, &AuthConfig::default());

        assert_eq!(config.methods, MethodSet::PASSWORD);
        assert_eq!(config.max_auth_attempts, 3);
        assert_eq!(config.keys.len(), 1);
    }

    #[test]
    fn test_server_config_never_times_out_idle_sessions() {
        let key = KeyPair::generate_ed25519().unwrap();
        let config = server_config(key, &AuthConfig::default());

        assert_eq!(config.inactivity_timeout, None);
    }
}
