//! Error types for session stores.

use crate::domain::SessionId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already exists: {0}")]
    AlreadyExists(SessionId),

    /// An append would break the revision/outcome ordering of the session.
    #[error("out-of-order append to session {session}: {reason}")]
    OutOfOrder { session: SessionId, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;
