//! PTY management

mod session;

pub use session::{ExitDisposition, PtySession};
