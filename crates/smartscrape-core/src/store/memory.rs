//! In-memory session store.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{check_outcome_append, check_revision_append, SessionStore, StoreError, StoreResult};
use crate::domain::{ExecutionOutcome, ScriptRevision, SessionHistory, SessionId, SessionRecord};

/// Session store backed by a `HashMap<SessionId, SessionHistory>`.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionId, SessionHistory>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHistory>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let mut sessions = self.sessions();
        if sessions.contains_key(&record.id) {
            return Err(StoreError::AlreadyExists(record.id));
        }
        sessions.insert(record.id, SessionHistory::new(record.clone()));
        Ok(())
    }

    async fn update_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let mut sessions = self.sessions();
        let history = sessions
            .get_mut(&record.id)
            .ok_or(StoreError::SessionNotFound(record.id))?;
        history.session = record.clone();
        Ok(())
    }

    async fn append_revision(
        &self,
        session: SessionId,
        revision: &ScriptRevision,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions();
        let history = sessions
            .get_mut(&session)
            .ok_or(StoreError::SessionNotFound(session))?;
        check_revision_append(history, revision)?;
        history.revisions.push(revision.clone());
        Ok(())
    }

    async fn append_outcome(
        &self,
        session: SessionId,
        outcome: &ExecutionOutcome,
    ) -> StoreResult<()> {
        let mut sessions = self.sessions();
        let history = sessions
            .get_mut(&session)
            .ok_or(StoreError::SessionNotFound(session))?;
        check_outcome_append(history, outcome)?;
        history.outcomes.push(outcome.clone());
        Ok(())
    }

    async fn load_history(&self, session: SessionId) -> StoreResult<SessionHistory> {
        self.sessions()
            .get(&session)
            .cloned()
            .ok_or(StoreError::SessionNotFound(session))
    }

    async fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        let mut records: Vec<SessionRecord> = self
            .sessions()
            .values()
            .map(|h| h.session.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExecutionStatus, RevisionOrigin};

    #[tokio::test]
    async fn test_append_enforces_pairing() {
        let store = MemorySessionStore::new();
        let record = SessionRecord::new("https://example.com", "titles", 3);
        let id = record.id;
        store.create_session(&record).await.unwrap();

        let first = ScriptRevision::root("a", RevisionOrigin::Initial);
        store.append_revision(id, &first).await.unwrap();

        let second = ScriptRevision::child_of(&first, "b", RevisionOrigin::Repaired);
        let err = store.append_revision(id, &second).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { .. }));

        let outcome = ExecutionOutcome::runtime_failure(first.id(), "boom", None, 1);
        store.append_outcome(id, &outcome).await.unwrap();
        store.append_revision(id, &second).await.unwrap();

        let history = store.load_history(id).await.unwrap();
        assert_eq!(history.revisions.len(), 2);
        assert_eq!(history.outcomes.len(), 1);
        assert_eq!(history.outcomes[0].status, ExecutionStatus::RuntimeFailure);
    }

    #[tokio::test]
    async fn test_duplicate_and_missing_sessions() {
        let store = MemorySessionStore::new();
        let record = SessionRecord::new("u", "g", 3);
        store.create_session(&record).await.unwrap();
        assert!(matches!(
            store.create_session(&record).await,
            Err(StoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.load_history(SessionId::new()).await,
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_outcome_for_wrong_revision_rejected() {
        let store = MemorySessionStore::new();
        let record = SessionRecord::new("u", "g", 3);
        store.create_session(&record).await.unwrap();
        let rev = ScriptRevision::root("a", RevisionOrigin::Initial);
        store.append_revision(record.id, &rev).await.unwrap();

        let stray = ExecutionOutcome::runtime_failure(crate::domain::RevisionId::new(), "x", None, 0);
        assert!(store.append_outcome(record.id, &stray).await.is_err());
    }
}
