use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::daemon::reaper::CLEANUP_PERIOD;
use crate::daemon::shutdown::SHUTDOWN_TIMEOUT;
use crate::error::WorkerError;
use crate::worker::probe::HLS_MINIMUM_SEGMENTS;
use crate::worker::supervisor::{ACTIVE_IDLE_TIMEOUT, INACTIVE_IDLE_TIMEOUT, PLAYLIST_TIMEOUT};
use crate::worker::{IdlePolicy, ProfileScripts, SegmentProbe};

const DEFAULT_BASEDIR: &str = "/etc/transcode";
const PROFILES_DIR: &str = "profiles";

/// On-disk configuration. Every field is optional, missing ones fall back to
/// the built-in defaults.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub basedir: Option<PathBuf>,
    // scratch root holding one directory per job
    pub ramdisk: Option<PathBuf>,
    pub profiles: Option<PathBuf>,
    pub cleanup_period_secs: Option<u64>,
    pub active_idle_timeout_secs: Option<u64>,
    pub inactive_idle_timeout_secs: Option<u64>,
    pub playlist_timeout_secs: Option<u64>,
    pub min_segments: Option<usize>,
    pub shutdown_timeout_secs: Option<u64>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let cfg: ConfigFile = serde_yaml::from_str(&content).context("Failed to parse YAML config")?;
    Ok(cfg)
}

/// Values given on the command line or through the environment. They win
/// over the config file.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub basedir: Option<PathBuf>,
    pub ramdisk: Option<PathBuf>,
    pub profiles: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub basedir: PathBuf,
    /// Explicit scratch root. When unset one is picked at startup, see
    /// [`crate::rootpath::determine`].
    pub ramdisk: Option<PathBuf>,
    pub profiles: PathBuf,
    pub cleanup_period: Duration,
    pub active_idle_timeout: Duration,
    pub inactive_idle_timeout: Duration,
    pub playlist_timeout: Duration,
    pub min_segments: usize,
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let basedir = default_basedir();
        Config {
            profiles: basedir.join(PROFILES_DIR),
            basedir,
            ramdisk: None,
            cleanup_period: CLEANUP_PERIOD,
            active_idle_timeout: ACTIVE_IDLE_TIMEOUT,
            inactive_idle_timeout: INACTIVE_IDLE_TIMEOUT,
            playlist_timeout: PLAYLIST_TIMEOUT,
            min_segments: HLS_MINIMUM_SEGMENTS,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        }
    }
}

impl Config {
    /// Merges defaults, the config file and overrides, in that order of
    /// precedence from lowest to highest, and validates the result.
    pub fn resolve(file: ConfigFile, overrides: Overrides) -> Result<Config, WorkerError> {
        let defaults = Config::default();
        let basedir = overrides
            .basedir
            .or(file.basedir)
            .unwrap_or(defaults.basedir);
        let profiles = overrides
            .profiles
            .or(file.profiles)
            .unwrap_or_else(|| basedir.join(PROFILES_DIR));

        let secs = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_secs).unwrap_or(default)
        };
        let config = Config {
            basedir,
            ramdisk: overrides.ramdisk.or(file.ramdisk),
            profiles,
            cleanup_period: secs(file.cleanup_period_secs, defaults.cleanup_period),
            active_idle_timeout: secs(file.active_idle_timeout_secs, defaults.active_idle_timeout),
            inactive_idle_timeout: secs(
                file.inactive_idle_timeout_secs,
                defaults.inactive_idle_timeout,
            ),
            playlist_timeout: secs(file.playlist_timeout_secs, defaults.playlist_timeout),
            min_segments: file.min_segments.unwrap_or(defaults.min_segments),
            shutdown_timeout: secs(file.shutdown_timeout_secs, defaults.shutdown_timeout),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        let durations = [
            ("cleanup_period", self.cleanup_period),
            ("active_idle_timeout", self.active_idle_timeout),
            ("inactive_idle_timeout", self.inactive_idle_timeout),
            ("playlist_timeout", self.playlist_timeout),
            ("shutdown_timeout", self.shutdown_timeout),
        ];
        for (name, value) in durations {
            if value.is_zero() {
                return Err(WorkerError::Config(format!("{name} must be greater than zero")));
            }
        }
        if self.min_segments == 0 {
            return Err(WorkerError::Config(
                "min_segments must be greater than zero".to_string(),
            ));
        }
        if self.inactive_idle_timeout < self.active_idle_timeout {
            return Err(WorkerError::Config(format!(
                "inactive_idle_timeout ({:?}) is shorter than active_idle_timeout ({:?})",
                self.inactive_idle_timeout, self.active_idle_timeout
            )));
        }
        Ok(())
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        IdlePolicy {
            active: self.active_idle_timeout,
            inactive: self.inactive_idle_timeout,
        }
    }

    pub fn probe(&self) -> SegmentProbe {
        SegmentProbe::new(self.min_segments)
    }

    pub fn scripts(&self) -> ProfileScripts {
        ProfileScripts::new(&self.profiles)
    }
}

fn default_basedir() -> PathBuf {
    let basedir = PathBuf::from(DEFAULT_BASEDIR);
    if basedir.is_dir() {
        return basedir;
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::resolve(ConfigFile::default(), Overrides::default()).unwrap();
        assert_eq!(config.cleanup_period, Duration::from_secs(4));
        assert_eq!(config.playlist_timeout, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.min_segments, 2);
        assert_eq!(config.idle_policy(), IdlePolicy::default());
        assert_eq!(config.profiles, config.basedir.join("profiles"));
        assert!(config.ramdisk.is_none());
    }

    #[test]
    fn test_overrides_win_over_file() {
        let file: ConfigFile = serde_yaml::from_str(
            r#"
basedir: /srv/transcode
ramdisk: /srv/ram
active_idle_timeout_secs: 6
inactive_idle_timeout_secs: 30
min_segments: 3
"#,
        )
        .unwrap();
        let overrides = Overrides {
            ramdisk: Some(PathBuf::from("/mnt/fast")),
            ..Default::default()
        };
        let config = Config::resolve(file, overrides).unwrap();
        assert_eq!(config.basedir, PathBuf::from("/srv/transcode"));
        assert_eq!(config.profiles, PathBuf::from("/srv/transcode/profiles"));
        assert_eq!(config.ramdisk, Some(PathBuf::from("/mnt/fast")));
        assert_eq!(config.idle_policy().active, Duration::from_secs(6));
        assert_eq!(config.idle_policy().inactive, Duration::from_secs(30));
        assert_eq!(config.probe().min_segments(), 3);
        assert_eq!(config.scripts().root(), Path::new("/srv/transcode/profiles"));
    }

    #[test]
    fn test_rejects_zero_durations() {
        let file = ConfigFile {
            cleanup_period_secs: Some(0),
            ..Default::default()
        };
        let err = Config::resolve(file, Overrides::default()).unwrap_err();
        assert!(matches!(err, WorkerError::Config(msg) if msg.contains("cleanup_period")));
    }

    #[test]
    fn test_rejects_inverted_thresholds() {
        let file = ConfigFile {
            active_idle_timeout_secs: Some(30),
            inactive_idle_timeout_secs: Some(10),
            ..Default::default()
        };
        assert!(matches!(
            Config::resolve(file, Overrides::default()),
            Err(WorkerError::Config(_))
        ));
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let res: Result<ConfigFile, _> = serde_yaml::from_str("idle: 3\n");
        assert!(res.is_err());
    }

    #[test]
    fn test_load_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rkhls.yaml");
        fs::write(&path, "playlist_timeout_secs: 90\n").unwrap();
        let file = load_config(&path).unwrap();
        assert_eq!(file.playlist_timeout_secs, Some(90));

        assert!(load_config(&dir.path().join("missing.yaml")).is_err());
    }
}
