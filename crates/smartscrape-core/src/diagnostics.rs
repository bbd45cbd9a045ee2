//! Diagnostic reporter: turns a failed cycle into the structured payload the
//! generator repairs from.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{ExecutionOutcome, ExecutionStatus, SourceLocation};

/// What went wrong, one per failing status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyntaxError,
    PolicyViolation,
    RuntimeException,
    Timeout,
    EmptyResult,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::PolicyViolation => "policy_violation",
            ErrorKind::RuntimeException => "runtime_exception",
            ErrorKind::Timeout => "timeout",
            ErrorKind::EmptyResult => "empty_result",
        };
        write!(f, "{s}")
    }
}

/// How the generator is asked to approach the repair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairFraming {
    SyntaxCorrection,
    PolicyCorrection,
    CrashCorrection,
    PerformanceCorrection,
    /// The script ran cleanly but found nothing.
    LogicCorrection,
}

impl RepairFraming {
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::SyntaxError => RepairFraming::SyntaxCorrection,
            ErrorKind::PolicyViolation => RepairFraming::PolicyCorrection,
            ErrorKind::RuntimeException => RepairFraming::CrashCorrection,
            ErrorKind::Timeout => RepairFraming::PerformanceCorrection,
            ErrorKind::EmptyResult => RepairFraming::LogicCorrection,
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            RepairFraming::SyntaxCorrection => {
                "The script does not parse. Fix the syntax error and keep the extraction logic."
            }
            RepairFraming::PolicyCorrection => {
                "The script uses a module or builtin outside the sandbox. Rewrite it with the allowed imports only (requests, bs4 and the standard helpers) and no os/sys access."
            }
            RepairFraming::CrashCorrection => {
                "The script raised an exception. Fix the error that caused it."
            }
            RepairFraming::PerformanceCorrection => {
                "The script exceeded its time budget. Remove unbounded loops and limit the number of requests."
            }
            RepairFraming::LogicCorrection => {
                "The script ran but extracted no data. Check the CSS selectors against the page's HTML structure."
            }
        }
    }
}

/// Structured description of one failure.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticPayload {
    pub error_kind: ErrorKind,
    pub message: String,
    pub offending_location: Option<SourceLocation>,
    /// Tail of the most relevant output stream, within the configured budget.
    pub truncated_output_sample: String,
    pub framing: RepairFraming,
}

impl DiagnosticPayload {
    /// Text block handed to the generator.
    pub fn render(&self) -> String {
        let mut out = format!(
            "Error kind: {}\nMessage: {}\n",
            self.error_kind, self.message
        );
        if let Some(location) = self.offending_location {
            out.push_str(&format!("Location: {location}\n"));
        }
        if !self.truncated_output_sample.is_empty() {
            out.push_str("Output (tail):\n");
            out.push_str(&self.truncated_output_sample);
            if !self.truncated_output_sample.ends_with('\n') {
                out.push('\n');
            }
        }
        out.push_str("Instruction: ");
        out.push_str(self.framing.instruction());
        out.push('\n');
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReporterConfig {
    /// Character budget for `truncated_output_sample`.
    pub sample_chars: usize,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self { sample_chars: 2000 }
    }
}

/// Last `max` characters of `text`, split on a char boundary.
pub fn tail_chars(text: &str, max: usize) -> &str {
    let count = text.chars().count();
    if count <= max {
        return text;
    }
    let skip = count - max;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// A frame of the candidate script in a Python traceback.
static SCRIPT_FRAME_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"File "scraper\.py", line (\d+)"#).expect("script frame regex is valid")
});

/// Innermost frame of the candidate script in a Python traceback.
pub fn traceback_location(trace: &str) -> Option<SourceLocation> {
    SCRIPT_FRAME_REGEX
        .captures_iter(trace)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<usize>().ok())
        .last()
        .map(SourceLocation::line_only)
}

fn first_non_empty<'a>(candidates: &[&'a str]) -> &'a str {
    candidates
        .iter()
        .copied()
        .find(|s| !s.trim().is_empty())
        .unwrap_or("")
}

/// Build the diagnostic for a failed outcome; `None` on success.
///
/// Depends on the outcome alone, so a diagnostic rebuilt from stored history
/// equals the one produced live.
pub fn diagnose(
    outcome: &ExecutionOutcome,
    config: &ReporterConfig,
) -> Option<DiagnosticPayload> {
    let error_kind = match outcome.status {
        ExecutionStatus::Succeeded => return None,
        ExecutionStatus::ParseError => ErrorKind::SyntaxError,
        ExecutionStatus::PolicyViolation => ErrorKind::PolicyViolation,
        ExecutionStatus::RuntimeFailure => ErrorKind::RuntimeException,
        ExecutionStatus::Timeout => ErrorKind::Timeout,
        ExecutionStatus::EmptyResult => ErrorKind::EmptyResult,
    };

    let fallback_message = || {
        outcome
            .error_message
            .clone()
            .unwrap_or_else(|| format!("script finished with status {}", outcome.status))
    };

    let (message, offending_location, sample) = match error_kind {
        ErrorKind::SyntaxError | ErrorKind::PolicyViolation => {
            let (message, location) = match &outcome.policy_finding {
                Some(finding) => (finding.reason.clone(), finding.location),
                None => (fallback_message(), None),
            };
            (message, location, String::new())
        }
        ErrorKind::RuntimeException => {
            let trace = outcome.exception_trace.as_deref().unwrap_or("");
            let location = traceback_location(trace);
            let sample = first_non_empty(&[trace, &outcome.stderr, &outcome.stdout]);
            (fallback_message(), location, sample.to_string())
        }
        ErrorKind::Timeout => {
            let sample = first_non_empty(&[&outcome.stderr, &outcome.stdout]);
            (fallback_message(), None, sample.to_string())
        }
        ErrorKind::EmptyResult => {
            let records = if outcome.extracted_records.is_empty() {
                String::new()
            } else {
                serde_json::to_string(&outcome.extracted_records).unwrap_or_default()
            };
            let sample = first_non_empty(&[&outcome.stdout, &records, &outcome.stderr]);
            (fallback_message(), None, sample.to_string())
        }
    };

    Some(DiagnosticPayload {
        error_kind,
        message,
        offending_location,
        truncated_output_sample: tail_chars(&sample, config.sample_chars).to_string(),
        framing: RepairFraming::for_kind(error_kind),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RevisionId;
    use crate::sandbox::PolicyResult;
    use serde_json::json;

    fn failed(status: ExecutionStatus) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::runtime_failure(RevisionId::new(), "boom", None, 12);
        outcome.status = status;
        outcome
    }

    #[test]
    fn test_success_has_no_diagnostic() {
        let mut outcome = failed(ExecutionStatus::Succeeded);
        outcome.extracted_records = vec![json!({"a": 1})];
        assert!(diagnose(&outcome, &ReporterConfig::default()).is_none());
    }

    #[test]
    fn test_runtime_failure_uses_innermost_script_frame() {
        let mut outcome = failed(ExecutionStatus::RuntimeFailure);
        outcome.exception_trace = Some(
            "Traceback (most recent call last):\n  File \"harness.py\", line 70, in main\n  File \"scraper.py\", line 12, in scrape\n  File \"scraper.py\", line 4, in parse_row\nKeyError: 'price'\n"
                .into(),
        );
        outcome.error_message = Some("KeyError: 'price'".into());
        let diag = diagnose(&outcome, &ReporterConfig::default()).unwrap();
        assert_eq!(diag.error_kind, ErrorKind::RuntimeException);
        assert_eq!(diag.framing, RepairFraming::CrashCorrection);
        assert_eq!(diag.offending_location, Some(SourceLocation::line_only(4)));
        assert!(diag.truncated_output_sample.contains("KeyError"));
    }

    #[test]
    fn test_empty_result_framed_as_logic_correction() {
        let outcome = failed(ExecutionStatus::EmptyResult);
        let diag = diagnose(&outcome, &ReporterConfig::default()).unwrap();
        assert_eq!(diag.framing, RepairFraming::LogicCorrection);
        assert!(diag.render().contains("CSS selectors"));
    }

    #[test]
    fn test_policy_message_comes_from_recorded_finding() {
        let verdict = PolicyResult::Violation {
            reason: "import of 'socket' is not permitted".into(),
            offending_symbol: "socket".into(),
            location: SourceLocation::new(3, 8),
        };
        let finding = verdict.to_finding().unwrap();
        let outcome = ExecutionOutcome::rejected(
            RevisionId::new(),
            ExecutionStatus::PolicyViolation,
            finding,
        );
        let diag = diagnose(&outcome, &ReporterConfig::default()).unwrap();
        assert_eq!(diag.message, "import of 'socket' is not permitted");
        assert_eq!(diag.offending_location, Some(SourceLocation::new(3, 8)));
        assert_eq!(diag.framing, RepairFraming::PolicyCorrection);

        // A copy read back from storage diagnoses identically.
        let stored: ExecutionOutcome =
            serde_json::from_str(&serde_json::to_string(&outcome).unwrap()).unwrap();
        assert_eq!(diagnose(&stored, &ReporterConfig::default()), Some(diag));
    }

    #[test]
    fn test_sample_keeps_tail_on_char_boundary() {
        let mut outcome = failed(ExecutionStatus::Timeout);
        outcome.stdout = format!("{}終わり", "x".repeat(50));
        let config = ReporterConfig { sample_chars: 4 };
        let diag = diagnose(&outcome, &config).unwrap();
        assert_eq!(diag.truncated_output_sample, "x終わり");
        assert_eq!(diag.framing, RepairFraming::PerformanceCorrection);
    }

    #[test]
    fn test_diagnose_is_deterministic() {
        let outcome = failed(ExecutionStatus::RuntimeFailure);
        let config = ReporterConfig::default();
        assert_eq!(diagnose(&outcome, &config), diagnose(&outcome, &config));
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abc", 10), "abc");
        assert_eq!(tail_chars("abcdef", 2), "ef");
        assert_eq!(tail_chars("abc", 0), "");
    }
}
