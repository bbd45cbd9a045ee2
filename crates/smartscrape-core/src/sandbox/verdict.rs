//! Verdict of the static policy check.

use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionStatus, PolicyFinding, SourceLocation};

/// Result of checking one candidate source against the whitelist policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum PolicyResult {
    Approved,
    Violation {
        reason: String,
        offending_symbol: String,
        location: SourceLocation,
    },
    ParseError {
        message: String,
        location: SourceLocation,
    },
}

impl PolicyResult {
    pub fn is_approved(&self) -> bool {
        matches!(self, PolicyResult::Approved)
    }

    /// Outcome status for a rejected source; `None` when approved.
    pub fn rejection_status(&self) -> Option<ExecutionStatus> {
        match self {
            PolicyResult::Approved => None,
            PolicyResult::Violation { .. } => Some(ExecutionStatus::PolicyViolation),
            PolicyResult::ParseError { .. } => Some(ExecutionStatus::ParseError),
        }
    }

    /// The finding recorded on the outcome of a rejected source.
    pub fn to_finding(&self) -> Option<PolicyFinding> {
        match self {
            PolicyResult::Approved => None,
            PolicyResult::Violation {
                reason,
                offending_symbol,
                location,
            } => Some(PolicyFinding {
                reason: reason.clone(),
                offending_symbol: Some(offending_symbol.clone()),
                location: Some(*location),
            }),
            PolicyResult::ParseError { message, location } => Some(PolicyFinding {
                reason: message.clone(),
                offending_symbol: None,
                location: Some(*location),
            }),
        }
    }

    pub fn location(&self) -> Option<SourceLocation> {
        match self {
            PolicyResult::Approved => None,
            PolicyResult::Violation { location, .. } | PolicyResult::ParseError { location, .. } => {
                Some(*location)
            }
        }
    }
}

impl std::fmt::Display for PolicyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PolicyResult::Approved => write!(f, "approved"),
            PolicyResult::Violation {
                reason, location, ..
            } => write!(f, "policy violation at {location}: {reason}"),
            PolicyResult::ParseError { message, location } => {
                write!(f, "parse error at {location}: {message}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_status() {
        assert_eq!(PolicyResult::Approved.rejection_status(), None);
        let parse = PolicyResult::ParseError {
            message: "unexpected token".into(),
            location: SourceLocation::new(2, 5),
        };
        assert_eq!(parse.rejection_status(), Some(ExecutionStatus::ParseError));
        let finding = parse.to_finding().unwrap();
        assert!(finding.offending_symbol.is_none());
        assert_eq!(finding.location, Some(SourceLocation::new(2, 5)));
    }

    #[test]
    fn test_violation_serializes_tagged() {
        let v = PolicyResult::Violation {
            reason: "import of 'socket' is not permitted".into(),
            offending_symbol: "socket".into(),
            location: SourceLocation::new(1, 8),
        };
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json["verdict"], "violation");
        assert_eq!(json["offending_symbol"], "socket");
        assert_eq!(v.to_string(), "policy violation at line 1, column 8: import of 'socket' is not permitted");
    }
}
