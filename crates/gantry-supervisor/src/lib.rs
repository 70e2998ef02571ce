//! Shell-less child process supervision with bounded capture, timeouts and retries.

mod backoff;
mod error;
mod options;
mod supervisor;

pub use backoff::retry_delay;
pub use error::{ExecError, ExecErrorKind};
pub use options::{ExecOptions, KillSignal};
pub use supervisor::{CommandExecutor, ExecOutput, ProcessSupervisor};
