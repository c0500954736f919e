use std::io;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker has already been started")]
    AlreadyStarted,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("profile `{profile}` has no script at {}", path.display())]
    ProfileNotFound { profile: String, path: PathBuf },
    #[error("failed to prepare work directory {}: {source}", path.display())]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal process {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("shutdown timed out with {remaining} worker(s) still running")]
    ShutdownTimeout { remaining: usize },
}

/// Why a subprocess did not exit cleanly. A clean exit has no `ExitError`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExitError {
    #[error("exited with status code {0}")]
    Code(i32),
    #[error("terminated by signal {0}")]
    Signaled(i32),
    #[error("failed to wait for process exit: {0}")]
    Wait(String),
}

impl ExitError {
    pub fn from_status(status: ExitStatus) -> Option<Self> {
        if status.success() {
            return None;
        }
        match (status.code(), status.signal()) {
            (Some(code), _) => Some(ExitError::Code(code)),
            (None, Some(signal)) => Some(ExitError::Signaled(signal)),
            (None, None) => Some(ExitError::Code(-1)),
        }
    }

    /// Whether the process died from SIGKILL, which is how every stop ends.
    pub fn is_kill(&self) -> bool {
        matches!(self, ExitError::Signaled(sig) if *sig == nix::libc::SIGKILL)
    }
}

impl From<io::Error> for ExitError {
    fn from(e: io::Error) -> Self {
        ExitError::Wait(e.to_string())
    }
}
