//! Domain models for SmartScrape.
//!
//! - `ScriptRevision`: immutable version of a session's script
//! - `ExecutionOutcome`: result of one check/run cycle
//! - `SessionRecord` / `SessionHistory`: refinement session state and audit trail

pub mod digest;
pub mod error;
pub mod outcome;
pub mod revision;
pub mod session;

pub use digest::SourceDigest;
pub use error::{EngineError, EngineResult};
pub use outcome::{
    classify_records, is_meaningful_record, normalize_records, ExecutionOutcome, ExecutionStatus,
    PolicyFinding, SourceLocation,
};
pub use revision::{RevisionId, RevisionOrigin, ScriptRevision};
pub use session::{FatalReason, SessionHistory, SessionId, SessionRecord, SessionState};
