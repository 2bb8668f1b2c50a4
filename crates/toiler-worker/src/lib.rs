//! Consumer side of the queue: the claim-execute-resolve worker loop and
//! the adaptive forking supervisor that scales a pool of them.

mod config;
mod error;
mod process;
mod restart;
mod scale;
mod signals;
mod supervisor;
mod worker;

pub use config::{RestartPolicy, WorkerConfig};
pub use error::{Result, WorkerError};
pub use process::{FakeProcessControl, OsProcessControl, ProcessControl, ProcessEvent};
pub use scale::ScaleCommand;
pub use signals::SignalBridge;
pub use supervisor::{Supervisor, SupervisorConfig};
pub use worker::{Worker, WorkFn, EXIT_CLEAN, EXIT_RESTART};
