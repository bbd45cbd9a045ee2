//! Self-healing refinement loop.
//!
//! [`machine`] holds the pure transition and judgement rules; [`engine`]
//! drives sessions through them against the checker, runner, generator and
//! store.

pub mod engine;
pub mod machine;

pub use engine::{EngineSettings, RefinementEngine};
pub use machine::{can_transition, judge_cycle, CycleVerdict, FailureFingerprint};
