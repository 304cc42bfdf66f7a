//! Flow decision scripts.
//!
//! A decision script sees the finished task's variables, its iteration and
//! replica indexes and its result, and produces one decision:
//!
//! | kind        | binding  | type                      |
//! |-------------|----------|---------------------------|
//! | branch      | `branch` | `"if"` or `"else"`        |
//! | loop        | `loop_`  | boolean                   |
//! | replicate   | `runs`   | non-negative integer      |
//!
//! `loop` is a rhai keyword, hence the trailing underscore. Everything else a
//! script does, its final value included, is discarded with its scope.

use crate::core::task::FlowKind;
use crate::error::{Error, Result};
use crate::flow::sandbox::{describe_error, ScriptLimits};
use crate::flog_trace;
use rhai::{Dynamic, Map, Scope};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchChoice {
    If,
    Else,
}

/// Outcome of a flow script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDecision {
    Branch(BranchChoice),
    /// `true` re-enters the loop body.
    Loop(bool),
    /// Number of replicas; zero is legal.
    Replicate(u32),
}

impl FlowDecision {
    pub fn kind(&self) -> FlowKind {
        match self {
            FlowDecision::Branch(_) => FlowKind::Branch,
            FlowDecision::Loop(_) => FlowKind::Loop,
            FlowDecision::Replicate(_) => FlowKind::Replicate,
        }
    }
}

impl std::fmt::Display for FlowDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowDecision::Branch(BranchChoice::If) => write!(f, "branch=if"),
            FlowDecision::Branch(BranchChoice::Else) => write!(f, "branch=else"),
            FlowDecision::Loop(again) => write!(f, "loop={}", again),
            FlowDecision::Replicate(runs) => write!(f, "runs={}", runs),
        }
    }
}

/// Read-only view handed to a decision script.
///
/// Variables are layered: job variables, then task variables, then the
/// engine's system variables, later layers shadowing earlier ones.
#[derive(Debug, Clone, Default)]
pub struct ScriptScope {
    pub task_name: String,
    pub job: BTreeMap<String, String>,
    pub task: BTreeMap<String, String>,
    pub system: BTreeMap<String, String>,
    /// 0-based loop iteration of the finished instance.
    pub iteration: u32,
    pub replication: Option<u32>,
    /// Result reported for the finished instance.
    pub result: serde_json::Value,
}

impl ScriptScope {
    pub fn new(task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            ..Self::default()
        }
    }

    /// Flattened variables, system over task over job.
    pub fn variables(&self) -> BTreeMap<String, String> {
        let mut merged = self.job.clone();
        merged.extend(self.task.clone());
        merged.extend(self.system.clone());
        merged
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.system
            .get(key)
            .or_else(|| self.task.get(key))
            .or_else(|| self.job.get(key))
            .map(String::as_str)
    }
}

/// Evaluates flow scripts.
///
/// Implementations must not keep state between calls: each evaluation is
/// independent and deterministic for a given scope.
pub trait ScriptEvaluator: Send + Sync {
    /// # Errors
    /// Returns `FlowScriptError` when the script fails, times out, or does
    /// not produce a decision of the right type.
    fn evaluate(&self, kind: FlowKind, source: &str, scope: &ScriptScope) -> Result<FlowDecision>;
}

/// Evaluates flow scripts with rhai.
///
/// The decision variable starts out as unit; a script that leaves it unset
/// fails. Scripts see `variables` (a map of strings), `iteration`, `replication`
/// (unit outside replicas) and `result`.
#[derive(Debug, Clone, Default)]
pub struct RhaiEvaluator {
    limits: ScriptLimits,
}

impl RhaiEvaluator {
    pub fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &ScriptLimits {
        &self.limits
    }
}

impl ScriptEvaluator for RhaiEvaluator {
    fn evaluate(&self, kind: FlowKind, source: &str, scope: &ScriptScope) -> Result<FlowDecision> {
        let fail = |reason: String| Error::FlowScriptError {
            task: scope.task_name.clone(),
            reason,
        };

        let engine = self.limits.engine(None);
        let mut rhai_scope = Scope::new();

        let mut variables = Map::new();
        for (key, value) in scope.variables() {
            variables.insert(key.into(), Dynamic::from(value));
        }
        rhai_scope.push("variables", variables);
        rhai_scope.push_constant("iteration", scope.iteration as i64);
        rhai_scope.push_constant_dynamic(
            "replication",
            scope
                .replication
                .map(|r| Dynamic::from(r as i64))
                .unwrap_or(Dynamic::UNIT),
        );
        let result = rhai::serde::to_dynamic(&scope.result).map_err(|e| fail(e.to_string()))?;
        rhai_scope.push_constant_dynamic("result", result);
        rhai_scope.push_dynamic(kind.binding(), Dynamic::UNIT);

        engine
            .run_with_scope(&mut rhai_scope, source)
            .map_err(|e| fail(describe_error(&e)))?;

        let bound = rhai_scope
            .get_value::<Dynamic>(kind.binding())
            .unwrap_or(Dynamic::UNIT);
        let decision = decide(kind, bound).map_err(fail)?;
        flog_trace!("flow script on {}: {}", scope.task_name, decision);
        Ok(decision)
    }
}

fn decide(kind: FlowKind, value: Dynamic) -> std::result::Result<FlowDecision, String> {
    if value.is_unit() {
        return Err(format!("script did not produce `{}`", kind.binding()));
    }
    let type_name = value.type_name();
    match kind {
        FlowKind::Branch => {
            let choice = value
                .into_string()
                .map_err(|_| format!("`branch` must be a string, got {}", type_name))?;
            match choice.as_str() {
                "if" => Ok(FlowDecision::Branch(BranchChoice::If)),
                "else" => Ok(FlowDecision::Branch(BranchChoice::Else)),
                other => Err(format!("`branch` must be \"if\" or \"else\", got \"{}\"", other)),
            }
        }
        FlowKind::Loop => value
            .as_bool()
            .map(FlowDecision::Loop)
            .map_err(|_| format!("`loop_` must be a boolean, got {}", type_name)),
        FlowKind::Replicate => {
            let runs = value
                .as_int()
                .map_err(|_| format!("`runs` must be an integer, got {}", type_name))?;
            u32::try_from(runs)
                .map(FlowDecision::Replicate)
                .map_err(|_| format!("`runs` must be a non-negative integer, got {}", runs))
        }
    }
}

/// Evaluator backed by a closure, for embedding and tests.
pub struct FnEvaluator<F> {
    f: F,
}

impl<F> FnEvaluator<F>
where
    F: Fn(FlowKind, &str, &ScriptScope) -> Result<FlowDecision> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ScriptEvaluator for FnEvaluator<F>
where
    F: Fn(FlowKind, &str, &ScriptScope) -> Result<FlowDecision> + Send + Sync,
{
    fn evaluate(&self, kind: FlowKind, source: &str, scope: &ScriptScope) -> Result<FlowDecision> {
        (self.f)(kind, source, scope)
    }
}
