//! Execution outcomes: the recorded result of one cycle for one revision.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::revision::RevisionId;

/// Result classification for one check/run cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Succeeded,
    RuntimeFailure,
    Timeout,
    EmptyResult,
    PolicyViolation,
    ParseError,
}

impl ExecutionStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionStatus::Succeeded)
    }

    /// Statuses decided by the policy checker; the source was never run.
    pub fn is_pre_execution(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::PolicyViolation | ExecutionStatus::ParseError
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Succeeded => "succeeded",
            ExecutionStatus::RuntimeFailure => "runtime_failure",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::EmptyResult => "empty_result",
            ExecutionStatus::PolicyViolation => "policy_violation",
            ExecutionStatus::ParseError => "parse_error",
        };
        f.pad(s)
    }
}

/// 1-based position in the candidate source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceLocation {
    pub line: usize,
    /// Unknown when the location was recovered from a runtime traceback.
    pub column: Option<usize>,
}

impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self {
            line,
            column: Some(column),
        }
    }

    pub fn line_only(line: usize) -> Self {
        Self { line, column: None }
    }
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(col) => write!(f, "line {}, column {}", self.line, col),
            None => write!(f, "line {}", self.line),
        }
    }
}

/// Why the policy checker refused a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyFinding {
    pub reason: String,
    pub offending_symbol: Option<String>,
    pub location: Option<SourceLocation>,
}

/// The recorded result of one check/run cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub revision_id: RevisionId,
    pub status: ExecutionStatus,
    pub stdout: String,
    pub stderr: String,
    pub exception_trace: Option<String>,
    /// One-line summary of what went wrong, absent on success.
    pub error_message: Option<String>,
    /// Present for `PolicyViolation` and `ParseError`.
    pub policy_finding: Option<PolicyFinding>,
    pub extracted_records: Vec<Value>,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

impl ExecutionOutcome {
    /// Outcome for a revision refused by the checker.
    pub fn rejected(revision_id: RevisionId, status: ExecutionStatus, finding: PolicyFinding) -> Self {
        debug_assert!(status.is_pre_execution());
        Self {
            revision_id,
            status,
            stdout: String::new(),
            stderr: String::new(),
            exception_trace: None,
            error_message: Some(finding.reason.clone()),
            policy_finding: Some(finding),
            extracted_records: Vec::new(),
            duration_ms: 0,
            finished_at: Utc::now(),
        }
    }

    /// Outcome for a run that never produced a result, including faults of the
    /// runner itself.
    pub fn runtime_failure(
        revision_id: RevisionId,
        message: impl Into<String>,
        exception_trace: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            revision_id,
            status: ExecutionStatus::RuntimeFailure,
            stdout: String::new(),
            stderr: String::new(),
            exception_trace,
            error_message: Some(message.into()),
            policy_finding: None,
            extracted_records: Vec::new(),
            duration_ms,
            finished_at: Utc::now(),
        }
    }

    pub fn record_count(&self) -> usize {
        self.extracted_records.len()
    }
}

/// Normalise whatever `scrape(url)` returned into an ordered record list.
///
/// `null` becomes an empty list, an array is taken as-is, any other value is
/// a single record.
pub fn normalize_records(value: Value) -> Vec<Value> {
    match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items,
        other => vec![other],
    }
}

/// Minimal non-empty criterion, applied uniformly regardless of data shape.
///
/// An object needs at least one non-null field, an array at least one
/// meaningful element, a string must be non-empty; numbers and booleans count.
pub fn is_meaningful_record(record: &Value) -> bool {
    match record {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
        Value::Array(items) => items.iter().any(is_meaningful_record),
        Value::Object(fields) => fields.values().any(|v| !v.is_null()),
    }
}

/// `Succeeded` when any record is meaningful, `EmptyResult` otherwise.
pub fn classify_records(records: &[Value]) -> ExecutionStatus {
    if records.iter().any(is_meaningful_record) {
        ExecutionStatus::Succeeded
    } else {
        ExecutionStatus::EmptyResult
    }
}
