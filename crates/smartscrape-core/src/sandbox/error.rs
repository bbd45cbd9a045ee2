//! Error types for the sandbox runner internals.
//!
//! These never leave the runner: every variant is folded into a
//! `RuntimeFailure` outcome.

/// Faults of the runner itself, as opposed to failures of the script.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to prepare run workspace: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("failed to spawn interpreter '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for interpreter: {0}")]
    Wait(#[source] std::io::Error),

    #[error("{0} was not piped")]
    MissingPipe(&'static str),

    #[error("harness result unreadable: {0}")]
    Report(String),

    #[error("worker pool closed")]
    PoolClosed,

    #[error("runner task failed: {0}")]
    Task(String),
}

/// Result type for sandbox internals.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
