//! Pure transition rules of the refinement state machine.
//!
//! ```text
//! Drafting -> Checking -> Running -> Succeeded
//!                |           |
//!                +-----------+-> NeedsFix -> Drafting (repair / submit)
//!                                   |
//!                                   +-> Fatal
//! ```
//! A failing cycle is judged immediately: the session lands in `Fatal` as
//! soon as it cannot be repaired any more, never one `fix` call later.

use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticPayload;
use crate::domain::{ExecutionStatus, FatalReason, SessionState, SourceDigest};

/// What a failed cycle looked like. Two equal fingerprints in a row mean the
/// repair changed nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FailureFingerprint {
    pub source_digest: SourceDigest,
    pub diagnostic: DiagnosticPayload,
}

impl FailureFingerprint {
    pub fn new(source_digest: SourceDigest, diagnostic: DiagnosticPayload) -> Self {
        Self {
            source_digest,
            diagnostic,
        }
    }
}

/// Where a finished cycle leaves the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleVerdict {
    Succeeded,
    NeedsFix,
    Fatal(FatalReason),
}

impl CycleVerdict {
    pub fn state(&self) -> SessionState {
        match self {
            CycleVerdict::Succeeded => SessionState::Succeeded,
            CycleVerdict::NeedsFix => SessionState::NeedsFix,
            CycleVerdict::Fatal(_) => SessionState::Fatal,
        }
    }
}

/// Judge a finished cycle.
///
/// `iteration` is the session's iteration count for the revision that just
/// ran; `previous` is the fingerprint of the cycle before it, if that one
/// failed too.
pub fn judge_cycle(
    status: ExecutionStatus,
    iteration: u32,
    max_iterations: u32,
    previous: Option<&FailureFingerprint>,
    current: Option<&FailureFingerprint>,
    detect_no_progress: bool,
) -> CycleVerdict {
    if status.is_success() {
        return CycleVerdict::Succeeded;
    }
    if iteration >= max_iterations {
        return CycleVerdict::Fatal(FatalReason::IterationsExhausted);
    }
    if detect_no_progress {
        if let (Some(prev), Some(cur)) = (previous, current) {
            if prev == cur {
                return CycleVerdict::Fatal(FatalReason::NoProgress);
            }
        }
    }
    CycleVerdict::NeedsFix
}

/// Whether the engine may move a session from `from` to `to`.
pub fn can_transition(from: SessionState, to: SessionState) -> bool {
    use SessionState::*;
    matches!(
        (from, to),
        (Drafting, Checking)
            | (Drafting, Fatal)
            | (Checking, Running)
            | (Checking, NeedsFix)
            | (Checking, Fatal)
            | (Running, Succeeded)
            | (Running, NeedsFix)
            | (Running, Fatal)
            | (NeedsFix, Drafting)
            | (NeedsFix, Fatal)
            | (Succeeded, Drafting)
            | (Fatal, Drafting)
    )
}
