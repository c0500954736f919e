use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rkhls::{
    CommandFactory, CommandSpec, GroupProcess, JobKey, ProcessHandle, Termination, WorkerError,
    WorkerRegistry, WorkerSupervisor,
};

/// Runs `script` with `/bin/sh -c`, the job source as `$1`, inside the job's
/// work directory.
#[derive(Debug, Clone)]
pub struct ShellFactory {
    script: String,
    spawns: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl ShellFactory {
    pub fn new<S: Into<String>>(script: S) -> Self {
        ShellFactory {
            script: script.into(),
            spawns: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// How many commands were handed out so far.
    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl CommandFactory for ShellFactory {
    fn command(&self, key: &JobKey) -> Result<CommandSpec, WorkerError> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(CommandSpec::new("/bin/sh").args([
            "-c",
            self.script.as_str(),
            "rkhls-test",
            key.source(),
        ]))
    }
}

/// Refuses the first `failures` termination requests, then kills the group.
#[allow(dead_code)]
#[derive(Debug)]
pub struct FailingKill {
    inner: GroupProcess,
    failures: AtomicUsize,
}

#[allow(dead_code)]
impl FailingKill {
    pub fn boxed(pid: u32, failures: usize) -> Box<dyn ProcessHandle> {
        Box::new(FailingKill {
            inner: GroupProcess::new(pid),
            failures: AtomicUsize::new(failures),
        })
    }
}

impl ProcessHandle for FailingKill {
    fn pid(&self) -> u32 {
        self.inner.pid()
    }

    fn terminate_group(&self) -> Result<Termination, WorkerError> {
        let refused = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(WorkerError::Signal {
                pid: self.pid(),
                reason: "EPERM: Operation not permitted".to_string(),
            });
        }
        self.inner.terminate_group()
    }

    fn terminate_leftovers(&self) -> Result<bool, WorkerError> {
        self.inner.terminate_leftovers()
    }
}

#[allow(dead_code)]
pub fn key(source: &str) -> JobKey {
    JobKey::new("default", source)
}

#[allow(dead_code)]
pub fn registry(root: &Path, factory: &ShellFactory) -> WorkerRegistry {
    WorkerRegistry::new(root, Arc::new(factory.clone()))
}

#[allow(dead_code)]
pub fn supervisor(root: &Path, factory: &ShellFactory, source: &str) -> Arc<WorkerSupervisor> {
    Arc::new(WorkerSupervisor::new(
        key(source),
        root,
        Arc::new(factory.clone()),
    ))
}

/// Waits for the exit watcher, failing the test after ten seconds.
#[allow(dead_code)]
pub async fn wait_terminated(worker: &WorkerSupervisor) {
    tokio::time::timeout(Duration::from_secs(10), worker.wait_terminated())
        .await
        .unwrap_or_else(|_| panic!("worker {} did not terminate", worker.key()));
}

/// Polls `cond` every 20ms until it holds or `timeout` elapses.
#[allow(dead_code)]
pub async fn wait_until<F>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// A process is gone once it no longer exists or only its zombie is left.
#[allow(dead_code)]
pub fn process_gone(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return true;
    };
    // the state follows the parenthesised command name
    stat.rsplit_once(')')
        .map(|(_, rest)| rest.trim_start().starts_with('Z'))
        .unwrap_or(false)
}

/// Reads a pid a test script wrote to `path`, waiting for it to show up.
#[allow(dead_code)]
pub async fn read_pid(path: &Path) -> u32 {
    let found = wait_until(Duration::from_secs(5), || {
        fs::read_to_string(path)
            .map(|s| s.trim().parse::<u32>().is_ok())
            .unwrap_or(false)
    })
    .await;
    assert!(found, "no pid written to {}", path.display());
    fs::read_to_string(path).unwrap().trim().parse().unwrap()
}
