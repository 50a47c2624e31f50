//! tg-broker: Auth broker protocol for ttygate
//!
//! This crate defines the request/response exchange with the credential
//! backend and a small TCP client for it. A successful exchange yields an
//! opaque 64-byte [`Token`] that the gateway hands to the spawned
//! application instead of the user's password.

pub mod client;
pub mod error;
pub mod message;

pub use client::{AuthOutcome, BrokerClient, DEFAULT_BROKER_ADDRESS};
pub use error::BrokerError;
pub use message::{BrokerRequest, Credentials, Token, MAX_PASSWORD_LEN, MAX_USERNAME_LEN, TOKEN_LEN};
