//! Connection state machine
//!
//! Pure transition logic for one connection. The russh handler and the
//! driver feed it [`Event`]s and carry out the returned [`Action`]s; nothing
//! here touches the transport, so every guard can be tested directly.

use std::time::Duration;

use tg_core::config::AuthConfig;

/// Where a connection is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    PreAuth,
    AuthGate,
    AwaitingChannel,
    Relaying,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Unauthenticated,
    Authenticated,
    Denied,
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ChildExited,
    ChannelClosed,
    TransportFailed,
    /// A PTY or spawn failure that ends the session
    SessionFailed,
}

/// Why a connection was dropped before relaying
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    HandshakeFailed,
    TransportFailed,
    AttemptsExhausted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    HandshakeComplete,
    TransportFailed,
    AuthAccepted,
    AuthRejected,
    ChannelOpened,
    /// Time spent in the gate since the previous tick
    Tick(Duration),
    RelayEnded(RelayEnd),
    DrainComplete,
    CloseAcknowledged,
    CloseWaitExpired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    AcceptAuth,
    RejectAuth,
    AcceptChannel,
    RejectChannel,
    StartRelay,
    Abort(AbortReason),
    Drain,
    AwaitClose,
    Terminate,
}

/// Limits on the pre-relay phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthPolicy {
    pub max_attempts: u32,
    /// Covers authentication and the wait for a channel
    pub timeout: Duration,
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: Duration::from_secs(10),
        }
    }
}

impl From<&AuthConfig> for AuthPolicy {
    fn from(config: &AuthConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            timeout: config.timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    phase: Phase,
    auth: AuthStatus,
    attempts: u32,
    waited: Duration,
    channel_open: bool,
    policy: AuthPolicy,
}

impl ConnectionState {
    pub fn new(policy: AuthPolicy) -> Self {
        Self {
            phase: Phase::PreAuth,
            auth: AuthStatus::Unauthenticated,
            attempts: 0,
            waited: Duration::ZERO,
            channel_open: false,
            policy,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn auth(&self) -> AuthStatus {
        self.auth
    }

    /// Failed authentication attempts so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Time spent before relaying started
    pub fn waited(&self) -> Duration {
        self.waited
    }

    pub fn channel_open(&self) -> bool {
        self.channel_open
    }

    pub fn policy(&self) -> AuthPolicy {
        self.policy
    }

    /// Apply an event in place
    pub fn apply(&mut self, event: Event) -> Vec<Action> {
        let (next, actions) = self.step(event);
        *self = next;
        actions
    }

    /// Compute the successor state and the actions to carry out
    pub fn step(mut self, event: Event) -> (Self, Vec<Action>) {
        // A password request means the transport handshake is done, even if
        // the driver has not reported it yet
        if self.phase == Phase::PreAuth
            && matches!(event, Event::AuthAccepted | Event::AuthRejected)
        {
            self.phase = Phase::AuthGate;
        }

        let actions = match (self.phase, event) {
            (Phase::PreAuth, Event::HandshakeComplete) => {
                self.phase = Phase::AuthGate;
                vec![]
            }
            (Phase::PreAuth, Event::TransportFailed) => {
                self.phase = Phase::Closed;
                vec![Action::Abort(AbortReason::HandshakeFailed)]
            }

            (Phase::AuthGate, Event::AuthAccepted) => {
                self.auth = AuthStatus::Authenticated;
                if self.channel_open {
                    self.phase = Phase::Relaying;
                    vec![Action::AcceptAuth, Action::StartRelay]
                } else {
                    self.phase = Phase::AwaitingChannel;
                    vec![Action::AcceptAuth]
                }
            }
            (Phase::AuthGate, Event::AuthRejected) => {
                self.attempts += 1;
                if self.attempts >= self.policy.max_attempts {
                    self.auth = AuthStatus::Denied;
                    self.phase = Phase::Closed;
                    vec![
                        Action::RejectAuth,
                        Action::Abort(AbortReason::AttemptsExhausted),
                    ]
                } else {
                    vec![Action::RejectAuth]
                }
            }
            (_, Event::AuthAccepted | Event::AuthRejected) => vec![Action::RejectAuth],

            (Phase::AuthGate | Phase::AwaitingChannel, Event::ChannelOpened)
                if !self.channel_open =>
            {
                self.channel_open = true;
                if self.auth == AuthStatus::Authenticated {
                    self.phase = Phase::Relaying;
                    vec![Action::AcceptChannel, Action::StartRelay]
                } else {
                    vec![Action::AcceptChannel]
                }
            }
            (_, Event::ChannelOpened) => vec![Action::RejectChannel],

            (Phase::AuthGate | Phase::AwaitingChannel, Event::Tick(elapsed)) => {
                self.waited = self.waited.saturating_add(elapsed);
                if self.waited >= self.policy.timeout {
                    if self.auth == AuthStatus::Unauthenticated {
                        self.auth = AuthStatus::Denied;
                    }
                    self.phase = Phase::Closed;
                    vec![Action::Abort(AbortReason::TimedOut)]
                } else {
                    vec![]
                }
            }
            (Phase::AuthGate | Phase::AwaitingChannel, Event::TransportFailed) => {
                self.phase = Phase::Closed;
                vec![Action::Abort(AbortReason::TransportFailed)]
            }

            (Phase::Relaying, Event::RelayEnded(_) | Event::TransportFailed) => {
                self.phase = Phase::Draining;
                vec![Action::Drain]
            }

            (Phase::Draining, Event::DrainComplete) => {
                self.phase = Phase::Closed;
                vec![Action::AwaitClose]
            }

            (Phase::Closed, Event::CloseAcknowledged | Event::CloseWaitExpired) => {
                vec![Action::Terminate]
            }

            _ => vec![],
        };

        (self, actions)
    }
}
