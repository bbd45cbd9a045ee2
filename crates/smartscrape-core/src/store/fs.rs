//! Filesystem-backed session store.
//!
//! Layout:
//! ```text
//! <root>/<session-id>/session.json
//! <root>/<session-id>/revisions.json
//! <root>/<session-id>/outcomes.json
//! ```
//! Every document is rewritten through a temp file in the same directory and
//! renamed into place, so readers never observe a partial write.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tempfile::NamedTempFile;

use super::{check_outcome_append, check_revision_append, SessionStore, StoreError, StoreResult};
use crate::domain::{
    ExecutionOutcome, ScriptRevision, SessionHistory, SessionId, SessionRecord,
};

const SESSION_FILE: &str = "session.json";
const REVISIONS_FILE: &str = "revisions.json";
const OUTCOMES_FILE: &str = "outcomes.json";

#[derive(Debug, Clone)]
pub struct FsSessionStore {
    root: PathBuf,
    // Serialises read-modify-write cycles on the session documents.
    write_lock: Arc<Mutex<()>>,
}

impl FsSessionStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> StoreResult<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn session_dir(&self, id: SessionId) -> PathBuf {
        self.root.join(id.to_string())
    }

    async fn blocking<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Path) -> StoreResult<T> + Send + 'static,
    {
        let root = self.root.clone();
        let lock = self.write_lock.clone();
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f(&root)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e.to_string())))?
    }
}

fn write_json_atomic<T: Serialize + ?Sized>(dir: &Path, name: &str, value: &T) -> StoreResult<()> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    serde_json::to_writer_pretty(&mut tmp, value)?;
    tmp.write_all(b"\n")?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| e.error)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<T> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn load_from(dir: &Path, id: SessionId) -> StoreResult<SessionHistory> {
    let session_path = dir.join(SESSION_FILE);
    if !session_path.is_file() {
        return Err(StoreError::SessionNotFound(id));
    }
    Ok(SessionHistory {
        session: read_json(&session_path)?,
        revisions: read_json(&dir.join(REVISIONS_FILE))?,
        outcomes: read_json(&dir.join(OUTCOMES_FILE))?,
    })
}

#[async_trait]
impl SessionStore for FsSessionStore {
    async fn create_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let dir = self.session_dir(record.id);
        let record = record.clone();
        self.blocking(move |_| {
            if dir.join(SESSION_FILE).exists() {
                return Err(StoreError::AlreadyExists(record.id));
            }
            std::fs::create_dir_all(&dir)?;
            write_json_atomic(&dir, REVISIONS_FILE, &Vec::<ScriptRevision>::new())?;
            write_json_atomic(&dir, OUTCOMES_FILE, &Vec::<ExecutionOutcome>::new())?;
            // Written last: its presence marks the session as complete.
            write_json_atomic(&dir, SESSION_FILE, &record)
        })
        .await
    }

    async fn update_session(&self, record: &SessionRecord) -> StoreResult<()> {
        let dir = self.session_dir(record.id);
        let record = record.clone();
        self.blocking(move |_| {
            if !dir.join(SESSION_FILE).is_file() {
                return Err(StoreError::SessionNotFound(record.id));
            }
            write_json_atomic(&dir, SESSION_FILE, &record)
        })
        .await
    }

    async fn append_revision(
        &self,
        session: SessionId,
        revision: &ScriptRevision,
    ) -> StoreResult<()> {
        let dir = self.session_dir(session);
        let revision = revision.clone();
        self.blocking(move |_| {
            let mut history = load_from(&dir, session)?;
            check_revision_append(&history, &revision)?;
            history.revisions.push(revision);
            write_json_atomic(&dir, REVISIONS_FILE, &history.revisions)
        })
        .await
    }

    async fn append_outcome(
        &self,
        session: SessionId,
        outcome: &ExecutionOutcome,
    ) -> StoreResult<()> {
        let dir = self.session_dir(session);
        let outcome = outcome.clone();
        self.blocking(move |_| {
            let mut history = load_from(&dir, session)?;
            check_outcome_append(&history, &outcome)?;
            history.outcomes.push(outcome);
            write_json_atomic(&dir, OUTCOMES_FILE, &history.outcomes)
        })
        .await
    }

    async fn load_history(&self, session: SessionId) -> StoreResult<SessionHistory> {
        let dir = self.session_dir(session);
        self.blocking(move |_| load_from(&dir, session)).await
    }

    async fn list_sessions(&self) -> StoreResult<Vec<SessionRecord>> {
        self.blocking(|root| {
            let mut records = Vec::new();
            for entry in std::fs::read_dir(root)? {
                let path = entry?.path().join(SESSION_FILE);
                if path.is_file() {
                    records.push(read_json::<SessionRecord>(&path)?);
                }
            }
            records.sort_by_key(|r| r.created_at);
            Ok(records)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RevisionOrigin, SessionState};

    #[tokio::test]
    async fn test_history_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let record = SessionRecord::new("https://example.com", "prices", 3);
        let id = record.id;
        let rev = ScriptRevision::root("def scrape(url):\n    return []\n", RevisionOrigin::Initial);

        {
            let store = FsSessionStore::new(dir.path()).unwrap();
            store.create_session(&record).await.unwrap();
            store.append_revision(id, &rev).await.unwrap();
            let outcome = ExecutionOutcome::runtime_failure(rev.id(), "boom", None, 3);
            store.append_outcome(id, &outcome).await.unwrap();

            let mut updated = record.clone();
            updated.transition(SessionState::NeedsFix);
            store.update_session(&updated).await.unwrap();
        }

        let store = FsSessionStore::new(dir.path()).unwrap();
        let history = store.load_history(id).await.unwrap();
        assert_eq!(history.session.state, SessionState::NeedsFix);
        assert_eq!(history.revisions, vec![rev]);
        assert_eq!(history.outcomes.len(), 1);
        assert!(history.is_quiescent());

        let listed = store.list_sessions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
    }

    #[tokio::test]
    async fn test_missing_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path()).unwrap();
        let err = store.load_history(SessionId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSessionStore::new(dir.path()).unwrap();
        let record = SessionRecord::new("u", "g", 3);
        store.create_session(&record).await.unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path().join(record.id.to_string()))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 3);
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }
}
