//! Flow script evaluation.
//!
//! Decision scripts attached to tasks run in an isolated rhai scope. The
//! engine only talks to them through [`ScriptEvaluator`], so tests and
//! embedders can substitute plain closures.

pub mod evaluator;
pub mod sandbox;

pub use evaluator::{
    BranchChoice, FlowDecision, FnEvaluator, RhaiEvaluator, ScriptEvaluator, ScriptScope,
};
pub use sandbox::ScriptLimits;
