//! Engine-level error taxonomy.
//!
//! Script failures are never errors: they are recorded as
//! [`ExecutionStatus`](super::outcome::ExecutionStatus) values. These variants
//! cover misuse of the engine and failures of its collaborators.

use super::session::{SessionId, SessionState};
use crate::config::ConfigError;
use crate::generator::GeneratorError;
use crate::store::StoreError;

/// Errors produced by the refinement engine.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session {session} is {state}; cannot {operation}")]
    InvalidState {
        session: SessionId,
        state: SessionState,
        operation: &'static str,
    },

    #[error("session {0} was aborted")]
    Aborted(SessionId),

    #[error("session {0} has no successful revision to export")]
    NoSuccessfulRevision(SessionId),

    #[error("generator error: {0}")]
    Generator(#[from] GeneratorError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for engine operations.
pub type EngineResult<T> = std::result::Result<T, EngineError>;
