use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::JobKey;
use tracing::info;

use crate::error::WorkerError;

/// Sub directory of the profiles root holding the hls scripts.
const HLS_PROFILE_DIR: &str = "hls";
const PROFILE_SCRIPT_EXT: &str = "sh";

/// Everything needed to launch one job's subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub envs: Vec<(String, String)>,
    /// Working directory hint. The job's scratch directory is used when unset.
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        CommandSpec {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn current_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

/// Builds the command for a job. Called once per start, never cached.
pub trait CommandFactory: Send + Sync {
    fn command(&self, key: &JobKey) -> Result<CommandSpec, WorkerError>;
}

impl<F> CommandFactory for F
where
    F: Fn(&JobKey) -> Result<CommandSpec, WorkerError> + Send + Sync,
{
    fn command(&self, key: &JobKey) -> Result<CommandSpec, WorkerError> {
        self(key)
    }
}

/// Resolves a profile to `<profiles>/hls/<profile>.sh`, run with the source as
/// its only argument.
#[derive(Debug, Clone)]
pub struct ProfileScripts {
    root: PathBuf,
}

impl ProfileScripts {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        ProfileScripts { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn script_path(&self, profile: &str) -> PathBuf {
        self.root
            .join(HLS_PROFILE_DIR)
            .join(format!("{profile}.{PROFILE_SCRIPT_EXT}"))
    }

    /// Names of all profiles with a script, sorted.
    pub fn list(&self) -> io::Result<Vec<String>> {
        let dir = self.root.join(HLS_PROFILE_DIR);
        let mut profiles = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PROFILE_SCRIPT_EXT) {
                continue;
            }
            if let Some(name) = path.file_stem().and_then(|s| s.to_str()) {
                profiles.push(name.to_string());
            }
        }
        profiles.sort();
        Ok(profiles)
    }
}

fn valid_profile_name(profile: &str) -> bool {
    !profile.is_empty()
        && profile
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

impl CommandFactory for ProfileScripts {
    fn command(&self, key: &JobKey) -> Result<CommandSpec, WorkerError> {
        let profile = key.profile();
        if !valid_profile_name(profile) {
            return Err(WorkerError::Config(format!(
                "invalid profile name `{profile}`"
            )));
        }
        let path = self.script_path(profile);
        if !path.is_file() {
            return Err(WorkerError::ProfileNotFound {
                profile: profile.to_string(),
                path,
            });
        }
        info!(job = %key, script = %path.display(), "transcode starting");
        Ok(CommandSpec::new(path).arg(key.source()))
    }
}
