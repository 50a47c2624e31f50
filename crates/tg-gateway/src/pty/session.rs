//! PTY session management
//!
//! Owns one pseudo-terminal pair and, once spawned, the application attached
//! to its slave side. The child is reaped by pid so the exit status can be
//! told apart from a signal.

use std::io::{Read, Write};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize, SlavePty};

use tg_broker::Token;
use tg_core::config::ChildConfig;
use tg_core::error::SessionError;
use tg_core::process::is_process_alive;
use tg_core::TerminalSize;

/// How a session's child ended, as far as the peer is concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitDisposition {
    /// Exited on its own; the code is forwarded
    Exited(i32),
    /// Still running at teardown and killed; nothing is forwarded
    Killed,
    /// Terminated by a signal; nothing is forwarded
    Abnormal,
    /// No child was ever spawned
    NotStarted,
}

impl ExitDisposition {
    /// The exit status to report on the channel, if any
    pub fn exit_status(&self) -> Option<u32> {
        match self {
            ExitDisposition::Exited(code) => Some(*code as u32),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChildState {
    NotStarted,
    Running(Pid),
    Exited(i32),
    Signaled,
}

/// A PTY pair and the child process attached to it
pub struct PtySession {
    master: Box<dyn MasterPty + Send>,
    /// Held until spawn, then closed in this process
    slave: Option<Box<dyn SlavePty + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    size: TerminalSize,
    child: ChildState,
}

impl PtySession {
    /// Open a PTY pair with the given dimensions
    pub fn open(size: TerminalSize) -> Result<Self, SessionError> {
        tracing::debug!("Opening PTY with size {}", size);

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

        Ok(Self {
            master: pair.master,
            slave: Some(pair.slave),
            writer: None,
            size,
            child: ChildState::NotStarted,
        })
    }

    /// Spawn the application on the slave side.
    ///
    /// The token is appended as the final argument. The slave is closed in
    /// this process afterwards so the master reports EOF once the child and
    /// its descendants let go of the terminal.
    pub fn spawn(&mut self, config: &ChildConfig, token: &Token) -> Result<u32, SessionError> {
        if self.child != ChildState::NotStarted {
            return Err(SessionError::AlreadyRunning);
        }
        let slave = self
            .slave
            .take()
            .ok_or_else(|| SessionError::Spawn("PTY slave already released".into()))?;

        let mut cmd = CommandBuilder::new(&config.program);
        cmd.args(&config.args);
        cmd.arg(token.as_os_str());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            cmd.cwd(dir);
        }

        let child = slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Spawn(format!("{}: {}", config.program.display(), e)))?;
        drop(slave);

        let pid = child
            .process_id()
            .ok_or_else(|| SessionError::Spawn("child has no process id".into()))?;
        self.child = ChildState::Running(Pid::from_raw(pid as i32));

        // Reaping goes through waitpid on the pid from here on
        drop(child);

        let writer = self
            .master
            .take_writer()
            .map_err(|e| SessionError::Spawn(format!("failed to take PTY writer: {}", e)))?;
        self.writer = Some(writer);

        tracing::info!("Spawned {} with PID {}", config.program.display(), pid);
        Ok(pid)
    }

    /// Clone a reader for the master side
    pub fn try_clone_reader(&self) -> Result<Box<dyn Read + Send>, SessionError> {
        self.master
            .try_clone_reader()
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))
    }

    /// Apply new dimensions to the terminal
    pub fn resize(&mut self, size: TerminalSize) -> Result<(), SessionError> {
        tracing::debug!("Resizing PTY to {}", size);

        self.master
            .resize(pty_size(size))
            .map_err(|e| SessionError::Resize(e.to_string()))?;
        self.size = size;
        Ok(())
    }

    /// Dimensions last applied
    pub fn size(&self) -> TerminalSize {
        self.size
    }

    /// Dimensions as the kernel currently reports them
    pub fn reported_size(&self) -> Result<TerminalSize, SessionError> {
        let size = self
            .master
            .get_size()
            .map_err(|e| SessionError::Io(std::io::Error::other(e.to_string())))?;
        Ok(TerminalSize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: size.pixel_width,
            pixel_height: size.pixel_height,
        })
    }

    /// Process ID of the child, if one was spawned
    pub fn pid(&self) -> Option<u32> {
        match self.child {
            ChildState::Running(pid) => Some(pid.as_raw() as u32),
            _ => None,
        }
    }

    /// Whether a child has been spawned, regardless of whether it still runs
    pub fn has_child(&self) -> bool {
        self.child != ChildState::NotStarted
    }

    /// Whether the child process still exists
    pub fn is_alive(&self) -> bool {
        match self.child {
            ChildState::Running(pid) => is_process_alive(pid.as_raw() as u32),
            _ => false,
        }
    }

    /// Forward peer input to the child.
    ///
    /// Input that arrives before the child starts or after it is gone is
    /// dropped silently.
    pub fn write_input(&mut self, data: &[u8]) -> Result<(), SessionError> {
        if !self.is_alive() {
            return Ok(());
        }
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };

        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    /// Collect the child's status without blocking.
    ///
    /// Returns true once the child has terminated and been reaped.
    pub fn try_reap(&mut self) -> bool {
        let ChildState::Running(pid) = self.child else {
            return self.child != ChildState::NotStarted;
        };

        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => {
                tracing::debug!("Child {} exited with code {}", pid, code);
                self.child = ChildState::Exited(code);
                true
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                tracing::debug!("Child {} terminated by {:?}", pid, signal);
                self.child = ChildState::Signaled;
                true
            }
            Ok(_) => false,
            Err(Errno::ECHILD) => {
                // Someone else collected it; the status is lost
                self.child = ChildState::Signaled;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to check child {}: {}", pid, e);
                false
            }
        }
    }

    /// Settle the child and report how it ended.
    ///
    /// A child that is still running is killed and reaped.
    pub fn finish(&mut self) -> ExitDisposition {
        self.try_reap();
        self.writer = None;

        match self.child {
            ChildState::NotStarted => ExitDisposition::NotStarted,
            ChildState::Exited(code) => ExitDisposition::Exited(code),
            ChildState::Signaled => ExitDisposition::Abnormal,
            ChildState::Running(pid) => {
                kill_and_reap(pid);
                self.child = ChildState::Signaled;
                ExitDisposition::Killed
            }
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        if let ChildState::Running(pid) = self.child {
            kill_and_reap(pid);
        }
    }
}

fn kill_and_reap(pid: Pid) {
    tracing::debug!("Killing child {}", pid);

    if let Err(e) = kill(pid, Signal::SIGKILL) {
        tracing::debug!("Failed to signal child {}: {}", pid, e);
    }
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(e) => {
                tracing::warn!("Failed to reap child {}: {}", pid, e);
                break;
            }
            Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
            Ok(_) => continue,
        }
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: size.pixel_width,
        pixel_height: size.pixel_height,
    }
}
