pub mod reaper;
pub mod shutdown;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::registry::WorkerRegistry;
use crate::rootpath;
use reaper::Reaper;
use shutdown::ShutdownCoordinator;

/// The running supervisor host: the job registry plus its background reaper.
#[derive(Debug)]
pub struct Service {
    config: Config,
    registry: WorkerRegistry,
    reaper: Option<JoinHandle<()>>,
    cancel: CancellationToken,
    coordinator: ShutdownCoordinator,
}

impl Service {
    /// Resolves the scratch root, builds the registry and starts the reaper.
    /// No job is started until one is requested.
    pub fn start(config: Config) -> Result<Self> {
        let scratch_root = rootpath::determine(config.ramdisk.clone())?;
        let registry = WorkerRegistry::builder(scratch_root.clone(), Arc::new(config.scripts()))
            .probe(Arc::new(config.probe()))
            .policy(config.idle_policy())
            .build();

        let cancel = CancellationToken::new();
        let reaper = Reaper::new(registry.clone(), config.cleanup_period).spawn(cancel.clone());
        let coordinator = ShutdownCoordinator::new(registry.clone(), config.shutdown_timeout);
        info!(
            scratch_root = %scratch_root.display(),
            profiles = %config.profiles.display(),
            "service started"
        );
        Ok(Service {
            config,
            registry,
            reaper: Some(reaper),
            cancel,
            coordinator,
        })
    }

    pub fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stops the reaper, then every job. Returns how many jobs were torn down.
    pub async fn shutdown(&mut self) -> Result<usize, WorkerError> {
        self.cancel.cancel();
        if let Some(reaper) = self.reaper.take()
            && let Err(e) = reaper.await
        {
            warn!(error = %e, "reaper task failed");
        }
        self.coordinator.shutdown().await
    }
}

/// Runs the service until SIGINT or SIGTERM.
pub async fn run(config: Config) -> Result<()> {
    let mut service = Service::start(config)?;
    shutdown_signal().await?;
    info!("Shutting down...");
    let stopped = service.shutdown().await.context("graceful shutdown failed")?;
    info!(jobs = stopped, "service stopped");
    Ok(())
}

pub async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .context("failed to install Ctrl+C handler")
    };

    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("failed to install signal handler")?;

    tokio::select! {
        res = ctrl_c => res,
        _ = terminate.recv() => Ok(()),
    }
}
