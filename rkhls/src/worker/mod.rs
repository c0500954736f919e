pub mod command;
pub mod hooks;
pub mod probe;
pub mod process;
pub mod supervisor;

pub use command::{CommandFactory, CommandSpec, ProfileScripts};
pub use hooks::EventHooks;
pub use probe::{ActivityProbe, SegmentProbe};
pub use process::{GroupProcess, ProcessHandle, Termination};
pub use supervisor::{HandleFactory, IdlePolicy, WorkerSupervisor};
