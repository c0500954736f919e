use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use common::{JobKey, WorkerState};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::error::{ExitError, WorkerError};
use crate::registry::Shared;
use crate::worker::command::CommandFactory;
use crate::worker::hooks::{EventHooks, OutputHook};
use crate::worker::probe::{ActivityProbe, SegmentProbe};
use crate::worker::process::{GroupProcess, ProcessHandle};

/// How long must an active stream be idle to be considered dead.
pub const ACTIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(12);
/// How long must an inactive stream be idle to be considered dead.
pub const INACTIVE_IDLE_TIMEOUT: Duration = Duration::from_secs(24);
/// How long a new job gets to produce its first usable output.
pub const PLAYLIST_TIMEOUT: Duration = Duration::from_secs(60);

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Wraps a freshly spawned pid into the handle used to terminate it.
pub type HandleFactory = Arc<dyn Fn(u32) -> Box<dyn ProcessHandle> + Send + Sync>;

fn group_process(pid: u32) -> Box<dyn ProcessHandle> {
    Box::new(GroupProcess::new(pid))
}

/// Idle thresholds, picked by whether the job already produces output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    pub active: Duration,
    pub inactive: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        IdlePolicy {
            active: ACTIVE_IDLE_TIMEOUT,
            inactive: INACTIVE_IDLE_TIMEOUT,
        }
    }
}

impl IdlePolicy {
    pub fn threshold(&self, active: bool) -> Duration {
        if active { self.active } else { self.inactive }
    }

    pub fn is_expired(&self, idle: Duration, active: bool) -> bool {
        idle > self.threshold(active)
    }
}

struct Inner {
    state: WorkerState,
    process: Option<Box<dyn ProcessHandle>>,
    last_request: Instant,
    active: bool,
    /// Whether the last stop reached the process. A failed attempt is retried.
    kill_delivered: bool,
    exit: Option<ExitError>,
}

/// Owns one transcoding subprocess and its scratch directory.
///
/// A supervisor is started at most once. After its process exited and the
/// directory was removed it stays `Terminated`; the next job for the same key
/// gets a new supervisor.
pub struct WorkerSupervisor {
    key: JobKey,
    work_dir: PathBuf,
    factory: Arc<dyn CommandFactory>,
    probe: Arc<dyn ActivityProbe>,
    policy: IdlePolicy,
    hooks: EventHooks,
    handle_factory: HandleFactory,
    registry: Option<Weak<Shared>>,
    inner: Mutex<Inner>,
    terminated: CancellationToken,
}

impl WorkerSupervisor {
    pub fn new(key: JobKey, scratch_root: &Path, factory: Arc<dyn CommandFactory>) -> Self {
        let work_dir = scratch_root.join(key.dir_name());
        WorkerSupervisor {
            key,
            work_dir,
            factory,
            probe: Arc::new(SegmentProbe::default()),
            policy: IdlePolicy::default(),
            hooks: EventHooks::default(),
            handle_factory: Arc::new(group_process),
            registry: None,
            inner: Mutex::new(Inner {
                state: WorkerState::Idle,
                process: None,
                last_request: Instant::now(),
                active: false,
                kill_delivered: false,
                exit: None,
            }),
            terminated: CancellationToken::new(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn ActivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn with_policy(mut self, policy: IdlePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_hooks(mut self, hooks: EventHooks) -> Self {
        self.hooks = hooks;
        self
    }

    /// Replaces how the spawned process is signalled. Defaults to
    /// [`GroupProcess`].
    pub fn with_process_handle<F>(self, factory: F) -> Self
    where
        F: Fn(u32) -> Box<dyn ProcessHandle> + Send + Sync + 'static,
    {
        self.with_handle_factory(Arc::new(factory))
    }

    pub(crate) fn with_handle_factory(mut self, factory: HandleFactory) -> Self {
        self.handle_factory = factory;
        self
    }

    pub(crate) fn with_registry(mut self, registry: Weak<Shared>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn policy(&self) -> IdlePolicy {
        self.policy
    }

    pub fn state(&self) -> WorkerState {
        self.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().process.as_ref().map(|p| p.pid())
    }

    pub fn last_request(&self) -> Instant {
        self.lock().last_request
    }

    /// Exit failure of the subprocess, `None` while running or after a clean exit.
    pub fn exit_error(&self) -> Option<ExitError> {
        self.lock().exit.clone()
    }

    /// Spawns the subprocess in its own process group.
    ///
    /// The supervisor lock is held until the process is attached, so a
    /// concurrent [`stop`](Self::stop) waits for the spawn to finish.
    /// Must be called from within a tokio runtime.
    pub fn start(self: &Arc<Self>) -> Result<(), WorkerError> {
        let mut inner = self.lock();
        if inner.state != WorkerState::Idle {
            return Err(WorkerError::AlreadyStarted);
        }
        inner.state = WorkerState::Starting;
        debug!(job = %self.key, "starting worker");

        let spec = self.factory.command(&self.key)?;
        prepare_work_dir(&self.work_dir)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(spec.current_dir.as_deref().unwrap_or(self.work_dir.as_path()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        inner.active = false;
        inner.last_request = Instant::now();
        self.hooks.fire_start();

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(
                    job = %self.key,
                    program = %spec.program.display(),
                    error = %source,
                    "failed to spawn worker"
                );
                if let Err(e) = remove_work_dir(&self.work_dir) {
                    warn!(job = %self.key, error = %e, "failed to clean work directory");
                }
                return Err(WorkerError::Spawn {
                    program: spec.program,
                    source,
                });
            }
        };

        let pid = child.id();
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(
                self.key.clone(),
                stderr,
                self.hooks.output_hook(),
            ));
        }
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(drain_stdout(self.key.clone(), stdout));
        }

        inner.process = pid.map(|pid| (self.handle_factory)(pid));
        inner.state = WorkerState::Running;
        info!(
            job = %self.key,
            pid = ?pid,
            dir = %self.work_dir.display(),
            "worker started"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let status = child.wait().await;
            this.handle_exit(status);
        });
        Ok(())
    }

    /// Kills the whole process group. Safe to call in any state.
    pub fn stop(&self) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        match inner.state {
            WorkerState::Running => {}
            WorkerState::Stopping if !inner.kill_delivered => {
                debug!(job = %self.key, "retrying stop");
            }
            state => {
                trace!(job = %self.key, %state, "nothing to stop");
                return;
            }
        }
        let Some(process) = inner.process.as_ref() else {
            return;
        };

        debug!(job = %self.key, pid = process.pid(), "performing stop");
        inner.state = WorkerState::Stopping;
        match process.terminate_group() {
            Ok(how) => {
                inner.kill_delivered = true;
                debug!(job = %self.key, ?how, "termination signal sent");
            }
            Err(e) => {
                inner.kill_delivered = false;
                error!(job = %self.key, error = %e, "failed to terminate worker");
            }
        }
    }

    /// Records a client access to the job's output.
    pub fn touch(&self) {
        self.lock().last_request = Instant::now();
    }

    /// Consults the activity probe. Once active, a job stays active.
    pub fn refresh_activity(&self) -> bool {
        {
            let inner = self.lock();
            if inner.active {
                return true;
            }
            if inner.state != WorkerState::Running {
                return false;
            }
        }
        // probe outside the lock, it reads the file system
        if !self.probe.is_active(&self.key, &self.work_dir) {
            return false;
        }
        let mut inner = self.lock();
        if inner.state == WorkerState::Running && !inner.active {
            inner.active = true;
            debug!(job = %self.key, "worker became active");
        }
        inner.active
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.lock().last_request)
    }

    /// Whether a running job has been idle past its threshold at `now`.
    pub fn should_stop(&self, now: Instant) -> bool {
        let inner = self.lock();
        if inner.state != WorkerState::Running {
            return false;
        }
        let idle = now.saturating_duration_since(inner.last_request);
        let stop = self.policy.is_expired(idle, inner.active);
        debug!(
            job = %self.key,
            idle = ?idle,
            active = inner.active,
            stop,
            "performing cleanup"
        );
        stop
    }

    /// Refreshes activity and stops the job if it idled out. A stop that
    /// never reached the process is retried whatever the idle time. Returns
    /// whether a stop was issued.
    pub fn cleanup_at(&self, now: Instant) -> bool {
        if self.kill_pending() {
            warn!(job = %self.key, "previous stop was not delivered");
            self.stop();
            return true;
        }
        self.refresh_activity();
        if self.should_stop(now) {
            self.stop();
            true
        } else {
            false
        }
    }

    fn kill_pending(&self) -> bool {
        let inner = self.lock();
        inner.state == WorkerState::Stopping && !inner.kill_delivered
    }

    pub fn cleanup(&self) -> bool {
        self.cleanup_at(Instant::now())
    }

    /// Waits until the job produces consumable output. Returns `false` when
    /// the job terminated or `timeout` elapsed first.
    pub async fn wait_active(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.refresh_activity() {
                return true;
            }
            if self.terminated.is_cancelled() || tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::select! {
                _ = self.terminated.cancelled() => return false,
                _ = sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    /// Resolves once the exit watcher finished tearing the job down.
    pub async fn wait_terminated(&self) {
        self.terminated.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    fn handle_exit(self: &Arc<Self>, status: io::Result<ExitStatus>) {
        let exit = match status {
            Ok(status) => ExitError::from_status(status),
            Err(e) => Some(ExitError::from(e)),
        };
        let stopping = self.state() == WorkerState::Stopping;
        match &exit {
            None => info!(job = %self.key, "worker exited successfully"),
            Some(e) if stopping && e.is_kill() => info!(job = %self.key, "worker stopped"),
            Some(ExitError::Code(code)) => {
                warn!(job = %self.key, exit_status = code, "worker exited with non-zero status")
            }
            Some(e) => warn!(job = %self.key, error = %e, "worker exited abnormally"),
        }

        // a leader exiting on its own may leave forked children behind
        let leftovers = self
            .lock()
            .process
            .as_ref()
            .map(|process| process.terminate_leftovers());
        match leftovers {
            Some(Ok(true)) if !stopping => {
                warn!(job = %self.key, "killed processes left behind by the worker")
            }
            Some(Err(e)) => warn!(job = %self.key, error = %e, "failed to kill leftover processes"),
            _ => {}
        }

        self.hooks.fire_stop(exit.as_ref());

        match remove_work_dir(&self.work_dir) {
            Ok(()) => debug!(job = %self.key, dir = %self.work_dir.display(), "cleaned work directory"),
            Err(e) => warn!(
                job = %self.key,
                dir = %self.work_dir.display(),
                error = %e,
                "failed to clean work directory"
            ),
        }

        {
            let mut inner = self.lock();
            inner.process = None;
            inner.state = WorkerState::Terminated;
            inner.exit = exit;
        }
        if let Some(registry) = self.registry.as_ref().and_then(Weak::upgrade) {
            registry.remove(&self.key, self);
        }
        self.terminated.cancel();
    }
}

impl fmt::Debug for WorkerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("WorkerSupervisor")
            .field("key", &self.key)
            .field("work_dir", &self.work_dir)
            .field("state", &inner.state)
            .field("pid", &inner.process.as_ref().map(|p| p.pid()))
            .field("active", &inner.active)
            .field("hooks", &self.hooks)
            .finish()
    }
}

/// Starts every job from an empty directory.
fn prepare_work_dir(dir: &Path) -> Result<(), WorkerError> {
    remove_work_dir(dir)
        .and_then(|_| fs::create_dir_all(dir))
        .map_err(|source| WorkerError::WorkDir {
            path: dir.to_path_buf(),
            source,
        })
}

fn remove_work_dir(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    }
}

async fn forward_stderr<R>(key: JobKey, stderr: R, hook: Option<OutputHook>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        match &hook {
            Some(hook) => hook(&line),
            None => debug!(job = %key, "{line}"),
        }
    }
}

// transcoders write their media to files; stdout is drained so a chatty
// script can never block on a full pipe
async fn drain_stdout<R>(key: JobKey, stdout: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        trace!(job = %key, stdout = %line);
    }
}
