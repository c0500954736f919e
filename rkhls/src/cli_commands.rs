use anyhow::{Context, Result, bail};
use common::JobKey;
use tokio::signal;
use tokio::time::interval;
use tracing::{info, warn};

use crate::config::Config;
use crate::daemon::Service;

/// Runs a single job in the foreground until it exits or Ctrl-C is pressed.
/// The job is kept alive by touching it like a consuming client would.
pub async fn run_job(config: Config, profile: &str, source: &str) -> Result<()> {
    let mut service = Service::start(config)?;
    let key = JobKey::new(profile, source);
    let followed = follow_job(&service, &key).await;
    let stopped = service.shutdown().await;
    followed?;
    stopped.context("failed to stop job")?;
    Ok(())
}

async fn follow_job(service: &Service, key: &JobKey) -> Result<()> {
    let worker = service
        .registry()
        .get_or_create(key)
        .with_context(|| format!("failed to start job {key}"))?;
    println!("job {key} started in {}", worker.work_dir().display());

    let playlist_timeout = service.config().playlist_timeout;
    let mut keepalive = interval(service.config().active_idle_timeout / 2);
    let ready = worker.wait_active(playlist_timeout);
    tokio::pin!(ready);
    let mut waiting = true;

    loop {
        tokio::select! {
            _ = keepalive.tick() => worker.touch(),
            active = &mut ready, if waiting => {
                waiting = false;
                if active {
                    println!("job {key} is producing output");
                } else if !worker.is_terminated() {
                    warn!(job = %key, timeout = ?playlist_timeout, "job produced no output in time");
                }
            }
            _ = worker.wait_terminated() => {
                return match worker.exit_error() {
                    None => {
                        info!(job = %key, "job finished");
                        Ok(())
                    }
                    Some(e) => bail!("job {key} failed: {e}"),
                };
            }
            res = signal::ctrl_c() => {
                res.context("failed to listen for Ctrl+C")?;
                info!(job = %key, "interrupted, stopping job");
                return Ok(());
            }
        }
    }
}

pub fn list_profiles(config: &Config) -> Result<()> {
    let scripts = config.scripts();
    let profiles = scripts
        .list()
        .with_context(|| format!("failed to list profiles in {}", scripts.root().display()))?;
    if profiles.is_empty() {
        println!("no profiles found in {}", scripts.root().display());
    }
    for profile in profiles {
        println!("{profile}");
    }
    Ok(())
}
