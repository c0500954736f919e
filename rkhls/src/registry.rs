use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use common::{JobKey, WorkerState};
use tracing::{debug, info};

use crate::error::WorkerError;
use crate::worker::{
    ActivityProbe, CommandFactory, EventHooks, HandleFactory, IdlePolicy, ProcessHandle,
    SegmentProbe, WorkerSupervisor,
};

type HookFactory = Arc<dyn Fn(&JobKey) -> EventHooks + Send + Sync>;
type CreationGate = Arc<Mutex<()>>;

pub(crate) struct Shared {
    workers: Mutex<HashMap<JobKey, Arc<WorkerSupervisor>>>,
    // one gate per key being created, so a slow start only holds up its own key
    creating: Mutex<HashMap<JobKey, CreationGate>>,
    scratch_root: PathBuf,
    factory: Arc<dyn CommandFactory>,
    probe: Arc<dyn ActivityProbe>,
    policy: IdlePolicy,
    hooks: Option<HookFactory>,
    handle_factory: Option<HandleFactory>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<JobKey, Arc<WorkerSupervisor>>> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn creation_gate(&self, key: &JobKey) -> CreationGate {
        let mut gates = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(key.clone()).or_default())
    }

    fn release_gate(&self, key: &JobKey, gate: CreationGate) {
        let mut gates = self.creating.lock().unwrap_or_else(PoisonError::into_inner);
        // the map and the caller hold the last two references
        if Arc::strong_count(&gate) == 2 {
            gates.remove(key);
        }
    }

    /// The registered job for `key` unless it already terminated.
    fn live(&self, key: &JobKey) -> Option<Arc<WorkerSupervisor>> {
        self.lock()
            .get(key)
            .filter(|worker| worker.state() != WorkerState::Terminated)
            .cloned()
    }

    /// Called by a supervisor once its process exited. A newer supervisor
    /// registered under the same key is left alone.
    pub(crate) fn remove(&self, key: &JobKey, worker: &Arc<WorkerSupervisor>) {
        let mut workers = self.lock();
        match workers.get(key) {
            Some(current) if Arc::ptr_eq(current, worker) => {
                workers.remove(key);
                debug!(job = %key, "worker deregistered");
            }
            _ => debug!(job = %key, "ignoring removal of a stale worker"),
        }
    }
}

/// Keyed collection of running jobs, at most one supervisor per key.
///
/// Cloning is cheap and every clone sees the same jobs.
#[derive(Clone)]
pub struct WorkerRegistry {
    shared: Arc<Shared>,
}

pub struct RegistryBuilder {
    scratch_root: PathBuf,
    factory: Arc<dyn CommandFactory>,
    probe: Arc<dyn ActivityProbe>,
    policy: IdlePolicy,
    hooks: Option<HookFactory>,
    handle_factory: Option<HandleFactory>,
}

impl RegistryBuilder {
    pub fn probe(mut self, probe: Arc<dyn ActivityProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn policy(mut self, policy: IdlePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Hooks for every new supervisor, built from its key while that key is
    /// being created.
    pub fn hooks<F>(mut self, hooks: F) -> Self
    where
        F: Fn(&JobKey) -> EventHooks + Send + Sync + 'static,
    {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    /// How every new job's process is signalled, see
    /// [`WorkerSupervisor::with_process_handle`].
    pub fn process_handle<F>(mut self, factory: F) -> Self
    where
        F: Fn(u32) -> Box<dyn ProcessHandle> + Send + Sync + 'static,
    {
        self.handle_factory = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> WorkerRegistry {
        WorkerRegistry {
            shared: Arc::new(Shared {
                workers: Mutex::new(HashMap::new()),
                creating: Mutex::new(HashMap::new()),
                scratch_root: self.scratch_root,
                factory: self.factory,
                probe: self.probe,
                policy: self.policy,
                hooks: self.hooks,
                handle_factory: self.handle_factory,
            }),
        }
    }
}

impl WorkerRegistry {
    pub fn builder<P: Into<PathBuf>>(
        scratch_root: P,
        factory: Arc<dyn CommandFactory>,
    ) -> RegistryBuilder {
        RegistryBuilder {
            scratch_root: scratch_root.into(),
            factory,
            probe: Arc::new(SegmentProbe::default()),
            policy: IdlePolicy::default(),
            hooks: None,
            handle_factory: None,
        }
    }

    pub fn new<P: Into<PathBuf>>(scratch_root: P, factory: Arc<dyn CommandFactory>) -> Self {
        Self::builder(scratch_root, factory).build()
    }

    pub fn scratch_root(&self) -> &Path {
        &self.shared.scratch_root
    }

    pub fn policy(&self) -> IdlePolicy {
        self.shared.policy
    }

    /// Returns the running job for `key`, starting a new one when there is
    /// none.
    ///
    /// Creation is serialized per key, so concurrent callers for the same key
    /// observe a single spawn while other keys stay available. A job that
    /// fails to start is not registered and its error is returned.
    pub fn get_or_create(&self, key: &JobKey) -> Result<Arc<WorkerSupervisor>, WorkerError> {
        if let Some(existing) = self.shared.live(key) {
            return Ok(existing);
        }
        let gate = self.shared.creation_gate(key);
        let created = {
            let _creating = gate.lock().unwrap_or_else(PoisonError::into_inner);
            self.create(key)
        };
        self.shared.release_gate(key, gate);
        created
    }

    fn create(&self, key: &JobKey) -> Result<Arc<WorkerSupervisor>, WorkerError> {
        // another caller may have finished creating while we waited
        if let Some(existing) = self.shared.live(key) {
            return Ok(existing);
        }

        let hooks = self
            .shared
            .hooks
            .as_ref()
            .map(|hooks| hooks(key))
            .unwrap_or_default();
        let mut worker = WorkerSupervisor::new(
            key.clone(),
            &self.shared.scratch_root,
            Arc::clone(&self.shared.factory),
        )
        .with_probe(Arc::clone(&self.shared.probe))
        .with_policy(self.shared.policy)
        .with_hooks(hooks)
        .with_registry(Arc::downgrade(&self.shared));
        if let Some(handle_factory) = &self.shared.handle_factory {
            worker = worker.with_handle_factory(Arc::clone(handle_factory));
        }
        let worker = Arc::new(worker);
        worker.start()?;

        let mut workers = self.shared.lock();
        // the exit watcher deregisters under this lock after marking the job
        // terminated, so a job that already exited must not be inserted
        if worker.state() == WorkerState::Terminated {
            debug!(job = %key, "worker exited before it was registered");
        } else {
            workers.insert(key.clone(), Arc::clone(&worker));
            info!(job = %key, jobs = workers.len(), "worker registered");
        }
        Ok(worker)
    }

    pub fn get(&self, key: &JobKey) -> Option<Arc<WorkerSupervisor>> {
        self.shared.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.shared.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.lock().is_empty()
    }

    /// Current jobs. Taken under the lock, used without it.
    pub fn snapshot(&self) -> Vec<Arc<WorkerSupervisor>> {
        self.shared.lock().values().cloned().collect()
    }

    /// Applies `f` to a snapshot of the current jobs, so `f` may freely stop
    /// jobs or create new ones.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<WorkerSupervisor>),
    {
        for worker in self.snapshot() {
            f(&worker);
        }
    }
}

impl fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("scratch_root", &self.shared.scratch_root)
            .field("policy", &self.shared.policy)
            .field("jobs", &self.len())
            .finish()
    }
}
