//! Append-only persistence for refinement sessions.
//!
//! A store keeps, per session, the session record plus two ordered logs:
//! revisions and outcomes. Outcome `n` always belongs to revision `n`, and
//! every revision after the first names its predecessor as parent. Both
//! implementations enforce this on append.

pub mod error;
pub mod fs;
pub mod memory;

use async_trait::async_trait;

use crate::domain::{ExecutionOutcome, ScriptRevision, SessionHistory, SessionId, SessionRecord};

pub use error::{StoreError, StoreResult};
pub use fs::FsSessionStore;
pub use memory::MemorySessionStore;

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<()>;

    /// Replace the stored record (state, counters, timestamps).
    async fn update_session(&self, record: &SessionRecord) -> StoreResult<()>;

    /// Append a revision. Fails unless every earlier revision has its
    /// outcome and `revision` is a child of the latest one.
    async fn append_revision(&self, session: SessionId, revision: &ScriptRevision)
        -> StoreResult<()>;

    /// Append the outcome of the oldest revision still waiting for one.
    async fn append_outcome(&self, session: SessionId, outcome: &ExecutionOutcome)
        -> StoreResult<()>;

    async fn load_history(&self, session: SessionId) -> StoreResult<SessionHistory>;

    /// All session records, oldest first.
    async fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>>;
}

pub(crate) fn check_revision_append(
    history: &SessionHistory,
    revision: &ScriptRevision,
) -> StoreResult<()> {
    let session = history.session.id;
    if !history.is_quiescent() {
        return Err(StoreError::OutOfOrder {
            session,
            reason: "previous revision has no outcome yet".to_string(),
        });
    }
    let expected_parent = history.latest_revision().map(|r| r.id());
    if revision.parent_revision_id() != expected_parent {
        return Err(StoreError::OutOfOrder {
            session,
            reason: format!(
                "revision {} does not extend the latest revision",
                revision.id()
            ),
        });
    }
    Ok(())
}

pub(crate) fn check_outcome_append(
    history: &SessionHistory,
    outcome: &ExecutionOutcome,
) -> StoreResult<()> {
    let session = history.session.id;
    match history.revisions.get(history.outcomes.len()) {
        Some(pending) if pending.id() == outcome.revision_id => Ok(()),
        Some(pending) => Err(StoreError::OutOfOrder {
            session,
            reason: format!(
                "outcome for {} but revision {} is pending",
                outcome.revision_id,
                pending.id()
            ),
        }),
        None => Err(StoreError::OutOfOrder {
            session,
            reason: format!("no pending revision for outcome {}", outcome.revision_id),
        }),
    }
}
