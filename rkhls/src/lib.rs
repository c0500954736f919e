pub mod cli_commands;
pub mod config;
pub mod daemon;
pub mod error;
pub mod registry;
pub mod rootpath;
pub mod worker;

// re-export selected public API
pub use common::{JobKey, WorkerState};
pub use config::{Config, ConfigFile, Overrides};
pub use daemon::Service;
pub use daemon::reaper::Reaper;
pub use daemon::shutdown::ShutdownCoordinator;
pub use error::{ExitError, WorkerError};
pub use registry::{RegistryBuilder, WorkerRegistry};
pub use worker::{
    ActivityProbe, CommandFactory, CommandSpec, EventHooks, GroupProcess, IdlePolicy,
    ProcessHandle, ProfileScripts, SegmentProbe, Termination, WorkerSupervisor,
};
