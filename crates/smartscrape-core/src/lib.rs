//! SmartScrape Core Library
//!
//! Checks, runs and repairs model-generated scraper scripts until one
//! extracts data, keeping an auditable history of every revision.

pub mod config;
pub mod diagnostics;
pub mod domain;
pub mod export;
pub mod generator;
pub mod obs;
pub mod refinement;
pub mod sandbox;
pub mod store;
pub mod telemetry;

pub use config::{ConfigError, EngineConfig, RefinementConfig};

pub use diagnostics::{diagnose, DiagnosticPayload, ErrorKind, RepairFraming, ReporterConfig};

pub use domain::{
    EngineError, EngineResult, ExecutionOutcome, ExecutionStatus, FatalReason, PolicyFinding,
    RevisionId, RevisionOrigin, ScriptRevision, SessionHistory, SessionId, SessionRecord,
    SessionState, SourceDigest, SourceLocation,
};

pub use export::{export_from_history, ExportBundle};

pub use generator::{
    ChatConfig, ChatGenerator, GeneratorError, PageSpec, RepairRequest, ScriptGenerator,
};

pub use refinement::{EngineSettings, RefinementEngine};

pub use sandbox::{
    IsolatedRunner, PolicyChecker, PolicyResult, RunRequest, RunnerConfig, ScriptExecutor,
    WhitelistPolicy, WorkerPool,
};

pub use store::{FsSessionStore, MemorySessionStore, SessionStore, StoreError};

/// Crate version, as reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
