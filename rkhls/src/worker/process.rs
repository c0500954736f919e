use std::fmt;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::{Pid, getpgid, getpgrp};
use tracing::{debug, warn};

use crate::error::WorkerError;

/// How a termination request reached the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The whole process group was killed.
    Group(i32),
    /// Only the direct child was killed; its descendants may survive.
    Direct,
}

/// Capability to forcefully end a spawned job and everything it forked.
pub trait ProcessHandle: Send + Sync + fmt::Debug {
    fn pid(&self) -> u32;

    fn terminate_group(&self) -> Result<Termination, WorkerError>;

    /// Kills whatever is left in the group after the leader exited on its
    /// own. Returns whether a signal was sent.
    fn terminate_leftovers(&self) -> Result<bool, WorkerError> {
        Ok(false)
    }
}

/// A child launched as the leader of its own process group.
#[derive(Debug)]
pub struct GroupProcess {
    pid: Pid,
    // resolved at spawn, the leader's pgid is gone once it was reaped
    pgid: Option<Pid>,
}

impl GroupProcess {
    /// Must be built before the child is reaped.
    pub fn new(pid: u32) -> Self {
        let pid = Pid::from_raw(pid as i32);
        let pgid = getpgid(Some(pid))
            .ok()
            .filter(|pgid| *pgid != getpgrp());
        GroupProcess { pid, pgid }
    }

    fn kill_direct(&self) -> Result<Termination, WorkerError> {
        kill(self.pid, Signal::SIGKILL).map_err(|e| WorkerError::Signal {
            pid: self.pid(),
            reason: e.to_string(),
        })?;
        Ok(Termination::Direct)
    }
}

impl ProcessHandle for GroupProcess {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn terminate_group(&self) -> Result<Termination, WorkerError> {
        let pid = self.pid.as_raw();
        let pgid = match getpgid(Some(self.pid)) {
            Ok(pgid) => pgid,
            Err(e) => {
                warn!(pid, error = %e, "could not get process group id, killing process only");
                return self.kill_direct();
            }
        };
        // never signal our own group, that would take the host down with the job
        if pgid == getpgrp() {
            warn!(
                pid,
                pgid = pgid.as_raw(),
                "process shares the host process group, killing process only"
            );
            return self.kill_direct();
        }
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => {
                debug!(pid, pgid = pgid.as_raw(), "killed process group");
                Ok(Termination::Group(pgid.as_raw()))
            }
            Err(e) => {
                warn!(pid, pgid = pgid.as_raw(), error = %e, "failed to kill process group, killing process only");
                self.kill_direct()
            }
        }
    }

    fn terminate_leftovers(&self) -> Result<bool, WorkerError> {
        let Some(pgid) = self.pgid else {
            return Ok(false);
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => {
                debug!(
                    pid = self.pid.as_raw(),
                    pgid = pgid.as_raw(),
                    "killed leftover group members"
                );
                Ok(true)
            }
            // the group died with its leader
            Err(Errno::ESRCH) => Ok(false),
            Err(e) => Err(WorkerError::Signal {
                pid: self.pid(),
                reason: e.to_string(),
            }),
        }
    }
}
