//! tg-gateway: SSH access gateway
//!
//! Accepts SSH connections, authenticates users against the credential
//! backend and runs the configured application on a PTY for each of them.
//! Every connection lives in its own process; the supervisor only accepts,
//! forks and reaps.

pub mod connection;
pub mod host_key;
pub mod pty;
pub mod relay;
pub mod supervisor;

pub use connection::ConnectionContext;
pub use host_key::load_or_generate_host_key;
pub use supervisor::{ConnectionProcess, Supervisor};
