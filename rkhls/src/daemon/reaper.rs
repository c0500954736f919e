use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::registry::WorkerRegistry;

/// How often idle jobs are looked for.
pub const CLEANUP_PERIOD: Duration = Duration::from_secs(4);

/// Periodically stops jobs nobody consumed for longer than their idle
/// threshold. Jobs deregister themselves once their process exited.
#[derive(Debug, Clone)]
pub struct Reaper {
    registry: WorkerRegistry,
    period: Duration,
}

impl Reaper {
    pub fn new(registry: WorkerRegistry, period: Duration) -> Self {
        Reaper { registry, period }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// One pass over all jobs as if the clock read `now`. Returns how many
    /// jobs were told to stop.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let mut stopped = 0;
        self.registry.for_each(|worker| {
            if worker.cleanup_at(now) {
                info!(
                    job = %worker.key(),
                    idle = ?worker.idle_for(now),
                    active = worker.is_active(),
                    "stopping idle worker"
                );
                stopped += 1;
            }
        });
        stopped
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Sweeps every period until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;
        debug!(period = ?self.period, "reaper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stopped = self.sweep();
                    if stopped > 0 {
                        debug!(stopped, jobs = self.registry.len(), "reaper sweep finished");
                    }
                }
            }
        }
        debug!("reaper stopped");
    }

    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(cancel))
    }
}
