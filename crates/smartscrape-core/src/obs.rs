//! Structured lifecycle events for refinement sessions.
//!
//! Cycle events are emitted inside a session-scoped span so that every line
//! (including runner and generator logs) carries the `session_id`.

use tracing::{info, warn, Span};

use crate::domain::{ExecutionStatus, FatalReason, SessionId, SessionState};

/// Span tagging everything done on behalf of one session.
pub fn session_span(session_id: SessionId) -> Span {
    tracing::info_span!("smartscrape.session", session_id = %session_id)
}

pub fn emit_session_created(session_id: SessionId, url: &str, max_iterations: u32) {
    info!(
        event = "session.created",
        session_id = %session_id,
        url = %url,
        max_iterations = max_iterations,
    );
}

pub fn emit_cycle_started(session_id: SessionId, iteration: u32, source_digest: &str) {
    info!(
        event = "cycle.started",
        session_id = %session_id,
        iteration = iteration,
        source_digest = %source_digest,
    );
}

pub fn emit_policy_rejected(session_id: SessionId, status: ExecutionStatus, reason: &str) {
    info!(
        event = "cycle.rejected",
        session_id = %session_id,
        status = %status,
        reason = %reason,
    );
}

pub fn emit_cycle_finished(
    session_id: SessionId,
    iteration: u32,
    status: ExecutionStatus,
    duration_ms: u64,
    records: usize,
) {
    info!(
        event = "cycle.finished",
        session_id = %session_id,
        iteration = iteration,
        status = %status,
        duration_ms = duration_ms,
        records = records,
    );
}

pub fn emit_repair_requested(session_id: SessionId, iteration: u32, error_kind: &str) {
    info!(
        event = "repair.requested",
        session_id = %session_id,
        iteration = iteration,
        error_kind = %error_kind,
    );
}

pub fn emit_session_terminal(
    session_id: SessionId,
    state: SessionState,
    reason: Option<FatalReason>,
    iterations: u32,
) {
    let reason = reason.map(|r| r.to_string()).unwrap_or_default();
    info!(
        event = "session.terminal",
        session_id = %session_id,
        state = %state,
        reason = %reason,
        iterations = iterations,
    );
}

/// Warning level: abort is always operator-initiated.
pub fn emit_session_aborted(session_id: SessionId, in_flight: bool) {
    warn!(event = "session.aborted", session_id = %session_id, in_flight = in_flight);
}

pub fn emit_generator_failed(session_id: SessionId, error: &dyn std::fmt::Display) {
    warn!(event = "generator.failed", session_id = %session_id, error = %error);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_span_enter() {
        let _span = session_span(SessionId::new()).entered();
    }
}
