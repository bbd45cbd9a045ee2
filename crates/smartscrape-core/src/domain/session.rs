//! Refinement sessions: the check/run/repair history for one (url, goal) pair.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::outcome::ExecutionOutcome;
use super::revision::ScriptRevision;

/// Unique identifier for a refinement session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(SessionId)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Refinement state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// The current revision is waiting to be checked.
    Drafting,
    Checking,
    Running,
    Succeeded,
    /// The last cycle failed and the repair budget is not exhausted.
    NeedsFix,
    Fatal,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::Fatal)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Drafting => "drafting",
            SessionState::Checking => "checking",
            SessionState::Running => "running",
            SessionState::Succeeded => "succeeded",
            SessionState::NeedsFix => "needs_fix",
            SessionState::Fatal => "fatal",
        };
        f.pad(s)
    }
}

/// Why a session ended in `Fatal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FatalReason {
    IterationsExhausted,
    /// Two consecutive failures with identical source and diagnostic.
    NoProgress,
    Aborted,
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FatalReason::IterationsExhausted => "iterations_exhausted",
            FatalReason::NoProgress => "no_progress",
            FatalReason::Aborted => "aborted",
        };
        write!(f, "{s}")
    }
}

/// Session metadata and state-machine position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub url: String,
    pub goal: String,
    /// Revisions that have entered the loop since the last (re)start; the
    /// initial revision counts as 1.
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub state: SessionState,
    pub fatal_reason: Option<FatalReason>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(url: impl Into<String>, goal: impl Into<String>, max_iterations: u32) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            url: url.into(),
            goal: goal.into(),
            iteration_count: 1,
            max_iterations,
            state: SessionState::Drafting,
            fatal_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `state`, stamping `updated_at`.
    pub fn transition(&mut self, state: SessionState) {
        self.state = state;
        if state != SessionState::Fatal {
            self.fatal_reason = None;
        }
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, reason: FatalReason) {
        self.transition(SessionState::Fatal);
        self.fatal_reason = Some(reason);
    }
}

/// Full ordered history of a session, as returned by `get_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHistory {
    pub session: SessionRecord,
    pub revisions: Vec<ScriptRevision>,
    pub outcomes: Vec<ExecutionOutcome>,
}

impl SessionHistory {
    pub fn new(session: SessionRecord) -> Self {
        Self {
            session,
            revisions: Vec::new(),
            outcomes: Vec::new(),
        }
    }

    /// True when every revision has its outcome.
    pub fn is_quiescent(&self) -> bool {
        self.revisions.len() == self.outcomes.len()
    }

    pub fn latest_revision(&self) -> Option<&ScriptRevision> {
        self.revisions.last()
    }

    /// Revision/outcome pairs in chronological order.
    pub fn cycles(&self) -> impl Iterator<Item = (&ScriptRevision, &ExecutionOutcome)> {
        self.revisions.iter().zip(self.outcomes.iter())
    }

    /// Most recent revision whose outcome was `Succeeded`.
    pub fn last_success(&self) -> Option<(&ScriptRevision, &ExecutionOutcome)> {
        self.cycles()
            .filter(|(_, outcome)| outcome.status.is_success())
            .last()
    }
}
