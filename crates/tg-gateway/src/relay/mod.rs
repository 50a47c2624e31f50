//! Channel relay
//!
//! Ties the session channel to a PTY session: allocation, resize, the single
//! permitted spawn, peer input and teardown. Child output travels through
//! the [`OutputPump`].

mod pump;

pub use pump::{OutputPump, OutputStream, PumpEvent, RelayChunk};

use std::io::Read;

use tg_core::config::ChildConfig;
use tg_core::error::SessionError;
use tg_core::TerminalSize;

use crate::connection::AuthContext;
use crate::pty::{ExitDisposition, PtySession};

/// Output sources the event loop monitors once a child is running
pub struct RelayRegistration {
    pub pid: u32,
    /// PTY master; also carries the child's stderr
    pub stdout: Box<dyn Read + Send>,
    /// Separate error stream, only for non-PTY exec
    pub stderr: Option<Box<dyn Read + Send>>,
}

impl std::fmt::Debug for RelayRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRegistration")
            .field("pid", &self.pid)
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// Result of a shell/exec request
#[derive(Debug)]
pub enum StartOutcome {
    /// Child started; its output must be registered
    Spawned(RelayRegistration),
    /// No PTY was requested; accepted without starting anything.
    ///
    /// Nothing runs without a PTY, so `RelayRegistration::stderr` stays unused.
    NoTerminal,
    /// A child was already started for this session
    AlreadyRunning,
}

/// Per-channel relay state
pub struct ChannelRelay {
    size: TerminalSize,
    pty: Option<PtySession>,
    command: ChildConfig,
    read_buffer_size: usize,
}

impl ChannelRelay {
    pub fn new(command: ChildConfig, read_buffer_size: usize) -> Self {
        Self {
            size: TerminalSize::default(),
            pty: None,
            command,
            read_buffer_size,
        }
    }

    /// Allocate the PTY pair for a `pty-req`
    pub fn allocate_pty(&mut self, size: TerminalSize) -> Result<(), SessionError> {
        if self.pty.is_some() {
            return Err(SessionError::PtyAlreadyAllocated);
        }

        self.size = size;
        self.pty = Some(PtySession::open(size)?);
        Ok(())
    }

    /// Record new dimensions and apply them if a PTY exists
    pub fn resize(&mut self, size: TerminalSize) -> Result<(), SessionError> {
        self.size = size;
        match self.pty.as_mut() {
            Some(pty) => pty.resize(size),
            None => Err(SessionError::NoPty),
        }
    }

    /// Start the application for a shell/exec request.
    ///
    /// Consumes the token in `auth`; only the first successful call spawns.
    pub fn start(&mut self, auth: &mut AuthContext) -> Result<StartOutcome, SessionError> {
        let Some(pty) = self.pty.as_mut() else {
            return Ok(StartOutcome::NoTerminal);
        };
        if pty.has_child() {
            return Ok(StartOutcome::AlreadyRunning);
        }

        let token = auth.take_token().ok_or(SessionError::MissingToken)?;
        let pid = pty.spawn(&self.command, &token)?;
        drop(token);

        Ok(StartOutcome::Spawned(RelayRegistration {
            pid,
            stdout: pty.try_clone_reader()?,
            stderr: None,
        }))
    }

    /// Forward peer input to the child, if there is one
    pub fn write_input(&mut self, data: &[u8]) -> Result<(), SessionError> {
        match self.pty.as_mut() {
            Some(pty) => pty.write_input(data),
            None => Ok(()),
        }
    }

    /// Reap the child if it has terminated
    pub fn child_exited(&mut self) -> bool {
        self.pty.as_mut().is_some_and(|pty| pty.try_reap())
    }

    /// Tear down the PTY and report how the child ended
    pub fn finish(&mut self) -> ExitDisposition {
        match self.pty.take() {
            Some(mut pty) => pty.finish(),
            None => ExitDisposition::NotStarted,
        }
    }

    pub fn size(&self) -> TerminalSize {
        self.size
    }

    pub fn pty(&self) -> Option<&PtySession> {
        self.pty.as_ref()
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }
}
