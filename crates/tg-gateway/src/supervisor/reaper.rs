//! Connection process reaper

use std::collections::HashMap;
use std::net::SocketAddr;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

/// Collects exited children of the supervisor
///
/// Besides the connection processes it forked, the supervisor may inherit
/// orphaned application processes; those are reaped too.
#[derive(Debug, Default)]
pub struct Reaper {
    live: HashMap<Pid, SocketAddr>,
}

impl Reaper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a connection process
    pub fn track(&mut self, pid: Pid, peer: SocketAddr) {
        self.live.insert(pid, peer);
    }

    /// Reap every child that has exited, without blocking.
    ///
    /// Returns the number of processes collected.
    pub fn reap(&mut self) -> usize {
        let mut reaped = 0;

        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(status) => {
                    let Some(pid) = status.pid() else { continue };
                    reaped += 1;
                    self.log_exit(pid, status);
                }
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => {
                    tracing::warn!("waitpid failed: {}", e);
                    break;
                }
            }
        }

        reaped
    }

    fn log_exit(&mut self, pid: Pid, status: WaitStatus) {
        match (self.live.remove(&pid), status) {
            (Some(peer), WaitStatus::Exited(_, code)) => {
                tracing::debug!("Connection process {} for {} exited ({})", pid, peer, code);
            }
            (Some(peer), WaitStatus::Signaled(_, signal, _)) => {
                tracing::warn!("Connection process {} for {} killed by {:?}", pid, peer, signal);
            }
            (None, _) => tracing::debug!("Reaped orphan {}", pid),
            _ => {}
        }
    }

    /// Number of connection processes still running
    pub fn live(&self) -> usize {
        self.live.len()
    }
}
