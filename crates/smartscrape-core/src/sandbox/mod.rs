//! Execution sandbox for generated scraper scripts.
//!
//! Two layers guard every candidate:
//! - [`PolicyChecker`]: static allow-list check over the syntax tree; rejected
//!   source is never executed.
//! - [`IsolatedRunner`]: runs approved source in a fresh interpreter process
//!   under restricted builtins, with a wall-clock budget, abort signal and
//!   bounded output capture, gated by a shared [`WorkerPool`].

pub mod checker;
pub mod error;
pub mod policy;
pub mod runner;
pub mod verdict;

pub use checker::{imported_modules, PolicyChecker};
pub use error::{SandboxError, SandboxResult};
pub use policy::WhitelistPolicy;
pub use runner::{
    IsolatedRunner, RunRequest, RunnerConfig, ScriptExecutor, WorkerPool, ABORTED_MESSAGE,
};
pub use verdict::PolicyResult;

pub(crate) use runner::wait_for_abort;
