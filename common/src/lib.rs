use serde::{Deserialize, Serialize};
use std::fmt;

/// Length of the key digest kept in a job's directory name.
const KEY_DIGEST_LEN: usize = 16;

/// Identifies one transcoding job: an encoding profile applied to a source.
///
/// Two requests naming the same profile and source share the same job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    profile: String,
    source: String,
}

impl JobKey {
    pub fn new<P, S>(profile: P, source: S) -> Self
    where
        P: Into<String>,
        S: Into<String>,
    {
        JobKey {
            profile: profile.into(),
            source: source.into(),
        }
    }

    pub fn profile(&self) -> &str {
        &self.profile
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Directory name used for this job under the scratch root.
    ///
    /// The sanitized profile is only a readable prefix. Uniqueness comes from
    /// the digest over the whole key, since sanitizing folds distinct profiles
    /// together and urls carry slashes, credentials and arbitrary length.
    pub fn dir_name(&self) -> String {
        let digest = sha256::digest(format!("{}\0{}", self.profile, self.source).as_str());
        format!(
            "{}-{}",
            sanitize(&self.profile),
            &digest[..KEY_DIGEST_LEN]
        )
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.profile, self.source)
    }
}

fn sanitize(s: &str) -> String {
    let cleaned: String = s
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "job".to_string()
    } else {
        cleaned
    }
}

/// Lifecycle of a worker supervisor. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Starting,
    Running,
    Stopping,
    Terminated,
}

impl WorkerState {
    /// Whether a subprocess may still be alive in this state.
    pub fn is_live(self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Stopping)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Idle => "idle",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Terminated => "terminated",
        };
        f.write_str(s)
    }
}
