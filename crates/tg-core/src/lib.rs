//! tg-core: Core abstractions and configuration for ttygate
//!
//! This crate provides the configuration, error taxonomy, domain types and
//! trait seams shared by the gateway daemon.

pub mod config;
pub mod error;
#[cfg(unix)]
pub mod process;
pub mod traits;
pub mod types;

pub use error::GatewayError;
pub use types::TerminalSize;
