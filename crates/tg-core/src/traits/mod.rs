//! Core trait definitions

mod authenticator;

pub use authenticator::Authenticator;
