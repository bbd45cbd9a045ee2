//! Script revisions: one immutable version of a session's source text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::digest::SourceDigest;

/// Unique identifier for a [`ScriptRevision`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionId(pub Uuid);

impl RevisionId {
    pub fn new() -> Self {
        RevisionId(Uuid::new_v4())
    }
}

impl Default for RevisionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where the source text of a revision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevisionOrigin {
    /// Supplied by the caller when the session was created.
    Initial,
    /// Produced by the generator from a page specification.
    Generated,
    /// Produced by the generator from a diagnostic.
    Repaired,
    /// Supplied by the caller on an existing session.
    Submitted,
}

impl std::fmt::Display for RevisionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RevisionOrigin::Initial => "initial",
            RevisionOrigin::Generated => "generated",
            RevisionOrigin::Repaired => "repaired",
            RevisionOrigin::Submitted => "submitted",
        };
        f.pad(s)
    }
}

/// One version of a session's script.
///
/// Fields are private: a revision is never modified after construction, a
/// repair always produces a new revision whose parent is the failing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptRevision {
    id: RevisionId,
    source_text: String,
    parent_revision_id: Option<RevisionId>,
    origin: RevisionOrigin,
    source_digest: SourceDigest,
    created_at: DateTime<Utc>,
}

impl ScriptRevision {
    /// First revision of a session.
    pub fn root(source_text: impl Into<String>, origin: RevisionOrigin) -> Self {
        Self::build(source_text.into(), None, origin)
    }

    /// Next revision in the chain after `parent`.
    pub fn child_of(
        parent: &ScriptRevision,
        source_text: impl Into<String>,
        origin: RevisionOrigin,
    ) -> Self {
        Self::build(source_text.into(), Some(parent.id), origin)
    }

    fn build(source_text: String, parent: Option<RevisionId>, origin: RevisionOrigin) -> Self {
        let source_digest = SourceDigest::of(&source_text);
        Self {
            id: RevisionId::new(),
            source_text,
            parent_revision_id: parent,
            origin,
            source_digest,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> RevisionId {
        self.id
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn parent_revision_id(&self) -> Option<RevisionId> {
        self.parent_revision_id
    }

    pub fn origin(&self) -> RevisionOrigin {
        self.origin
    }

    pub fn source_digest(&self) -> &SourceDigest {
        &self.source_digest
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_links_to_parent() {
        let root = ScriptRevision::root("a = 1", RevisionOrigin::Initial);
        let child = ScriptRevision::child_of(&root, "a = 2", RevisionOrigin::Repaired);

        assert!(root.parent_revision_id().is_none());
        assert_eq!(child.parent_revision_id(), Some(root.id()));
        assert_ne!(root.id(), child.id());
        assert_ne!(root.source_digest(), child.source_digest());
    }

    #[test]
    fn test_identical_source_shares_digest() {
        let root = ScriptRevision::root("same", RevisionOrigin::Initial);
        let child = ScriptRevision::child_of(&root, "same", RevisionOrigin::Repaired);
        assert_eq!(root.source_digest(), child.source_digest());
    }

    #[test]
    fn test_revision_serde_roundtrip() {
        let rev = ScriptRevision::root("def scrape(url):\n    return []", RevisionOrigin::Generated);
        let json = serde_json::to_string(&rev).unwrap();
        let back: ScriptRevision = serde_json::from_str(&json).unwrap();
        assert_eq!(rev, back);
    }
}
