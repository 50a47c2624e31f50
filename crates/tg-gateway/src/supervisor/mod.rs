//! Connection supervisor
//!
//! Accepts connections and moves each one into its own forked process. The
//! accept loop stays single-threaded and runtime-free so forking is safe;
//! exited processes are reaped between accepts.

mod reaper;

pub use reaper::Reaper;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::unistd::{fork, ForkResult};

use tg_core::error::{ConnectionError, GatewayError};

use crate::connection::{run_isolated, ConnectionContext};

/// A connection handed to a freshly forked process
pub struct ConnectionProcess {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub ctx: ConnectionContext,
}

impl ConnectionProcess {
    /// Serve the connection and return the exit code for this process
    pub fn run(self) -> i32 {
        run_isolated(self.stream, self.peer, self.ctx)
    }
}

/// Accept loop and process bookkeeping
pub struct Supervisor {
    listener: TcpListener,
    ctx: ConnectionContext,
    reaper: Reaper,
    reap_interval: Duration,
}

impl Supervisor {
    /// Bind the listening socket
    pub fn bind(
        bind_addr: &str,
        reap_interval: Duration,
        ctx: ConnectionContext,
    ) -> Result<Self, GatewayError> {
        let listener = TcpListener::bind(bind_addr)?;
        tracing::info!("SSH server listening on {}", listener.local_addr()?);

        become_subreaper();

        Ok(Self {
            listener,
            ctx,
            reaper: Reaper::new(),
            reap_interval,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until one is handed to a child process.
    ///
    /// In the supervisor this never returns except on a listener failure.
    /// In a forked child it returns the connection to serve; the listener is
    /// already closed there.
    pub fn run(mut self) -> Result<ConnectionProcess, GatewayError> {
        let timeout = PollTimeout::from(
            u16::try_from(self.reap_interval.as_millis()).unwrap_or(u16::MAX),
        );

        loop {
            let ready = {
                let mut fds = [PollFd::new(self.listener.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, timeout) {
                    Ok(n) => n > 0,
                    Err(Errno::EINTR) => false,
                    Err(e) => return Err(std::io::Error::from(e).into()),
                }
            };

            self.reaper.reap();
            if !ready {
                continue;
            }

            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            tracing::info!("New connection from {}", peer);

            // SAFETY: the supervisor runs no other threads, so the child
            // starts from a consistent copy of this process
            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    let Supervisor { listener, ctx, .. } = self;
                    drop(listener);
                    return Ok(ConnectionProcess { stream, peer, ctx });
                }
                Ok(ForkResult::Parent { child }) => {
                    tracing::debug!("Connection from {} handed to PID {}", peer, child);
                    self.reaper.track(child, peer);
                    drop(stream);
                }
                Err(e) => {
                    let error: GatewayError = ConnectionError::Isolation(e.to_string()).into();
                    tracing::error!("Dropping connection from {}: {}", peer, error);
                    drop(stream);
                }
            }
        }
    }

    pub fn live_connections(&self) -> usize {
        self.reaper.live()
    }
}

/// Adopt orphaned descendants so they are reaped here
#[cfg(target_os = "linux")]
fn become_subreaper() {
    // SAFETY: prctl with PR_SET_CHILD_SUBREAPER only sets a process flag
    let rc = unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) };
    if rc != 0 {
        tracing::warn!(
            "Failed to become child subreaper: {}",
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn become_subreaper() {}
