use std::fmt;
use std::sync::Arc;

use crate::error::ExitError;

pub type StartHook = Arc<dyn Fn() + Send + Sync>;
pub type OutputHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type StopHook = Arc<dyn Fn(Option<&ExitError>) + Send + Sync>;

/// Notifications emitted over a worker's lifetime.
///
/// Hooks run on the supervisor's own tasks: `on_start` while the supervisor
/// lock is held, `on_output_line` on the stderr reader, `on_stop` on the exit
/// watcher before the work directory is removed. They must return quickly and
/// must not call back into the supervisor that fired them.
#[derive(Clone, Default)]
pub struct EventHooks {
    on_start: Option<StartHook>,
    on_output_line: Option<OutputHook>,
    on_stop: Option<StopHook>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_start<F>(mut self, hook: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_start = Some(Arc::new(hook));
        self
    }

    /// Receives every stderr line of the subprocess instead of the logger.
    pub fn on_output_line<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_output_line = Some(Arc::new(hook));
        self
    }

    pub fn on_stop<F>(mut self, hook: F) -> Self
    where
        F: Fn(Option<&ExitError>) + Send + Sync + 'static,
    {
        self.on_stop = Some(Arc::new(hook));
        self
    }

    pub(crate) fn fire_start(&self) {
        if let Some(hook) = &self.on_start {
            hook();
        }
    }

    pub(crate) fn output_hook(&self) -> Option<OutputHook> {
        self.on_output_line.clone()
    }

    pub(crate) fn fire_stop(&self, err: Option<&ExitError>) {
        if let Some(hook) = &self.on_stop {
            hook(err);
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("on_start", &self.on_start.is_some())
            .field("on_output_line", &self.on_output_line.is_some())
            .field("on_stop", &self.on_stop.is_some())
            .finish()
    }
}
