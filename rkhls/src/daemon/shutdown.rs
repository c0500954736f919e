use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use tracing::{error, info, warn};

use crate::error::WorkerError;
use crate::registry::WorkerRegistry;

pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Stops every job on host shutdown and waits, bounded, for their exit.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    registry: WorkerRegistry,
    timeout: Duration,
    triggered: AtomicBool,
}

impl ShutdownCoordinator {
    pub fn new(registry: WorkerRegistry, timeout: Duration) -> Self {
        ShutdownCoordinator {
            registry,
            timeout,
            triggered: AtomicBool::new(false),
        }
    }

    /// Returns the number of jobs that were torn down. Only the first call
    /// does anything, later calls return `Ok(0)`.
    pub async fn shutdown(&self) -> Result<usize, WorkerError> {
        if self.triggered.swap(true, Ordering::SeqCst) {
            warn!("shutdown already triggered");
            return Ok(0);
        }

        let workers = self.registry.snapshot();
        info!(jobs = workers.len(), "stopping all workers");
        for worker in &workers {
            worker.stop();
        }

        let waits = workers.iter().map(|worker| worker.wait_terminated());
        match tokio::time::timeout(self.timeout, join_all(waits)).await {
            Ok(_) => {
                info!(jobs = workers.len(), "all workers terminated");
                Ok(workers.len())
            }
            Err(_) => {
                let remaining = workers.iter().filter(|w| !w.is_terminated()).count();
                for worker in workers.iter().filter(|w| !w.is_terminated()) {
                    error!(job = %worker.key(), state = %worker.state(), "worker did not terminate in time");
                }
                Err(WorkerError::ShutdownTimeout { remaining })
            }
        }
    }
}
