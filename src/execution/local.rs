//! In-process executor running task scripts with rhai.
//!
//! Each stage runs in one shared scope, in order: selection (must return
//! `true`), pre, implementation, post. Scripts see:
//!
//! - `variables`: job, task and system variables; changed or new entries
//!   are written back as job variables
//! - `results`: main results of direct predecessors
//! - `inputs`: keyed results of direct predecessors
//! - `result`: the task result, defaulting to the implementation's value
//! - `result_map`: keyed entries committed with the result
//! - `signals`: names of signals to send
//! - `iteration`, `replication`
//!
//! and three functions over the job's signals:
//!
//! - `has_signal(name)`: whether `name` was sent before this task started
//! - `ready_for_signal(name)`: declare that the job waits for `name`
//! - `remove_signal(name)`: consume `name` once this task finishes
//!
//! `${NAME}` in the implementation is replaced by the variable `NAME`
//! before it runs.

use crate::error::{Error, Result};
use crate::execution::executor::{Assignment, TaskExecutor, TaskOutcome, TaskOutput};
use crate::flow::sandbox::describe_error;
use crate::flow::ScriptLimits;
use crate::util::blocking;
use crate::{flog_debug, flog_trace};
use futures::future::BoxFuture;
use futures::FutureExt;
use regex::{Captures, Regex};
use rhai::{Array, Dynamic, EvalAltResult, Map, Scope};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

static VARIABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_.]*)\}").unwrap());

/// Replace `${NAME}` references with variable values. Unknown names are
/// left untouched.
pub fn substitute(source: &str, variables: &BTreeMap<String, String>) -> String {
    VARIABLE_RE
        .replace_all(source, |caps: &Captures| {
            variables
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

/// Signal calls made by a task's scripts.
#[derive(Debug, Default)]
struct SignalCalls {
    awaited: Vec<String>,
    removed: Vec<String>,
}

fn register_signal_api(engine: &mut rhai::Engine, sent: BTreeSet<String>) -> Arc<Mutex<SignalCalls>> {
    let calls = Arc::new(Mutex::new(SignalCalls::default()));
    let sent = Arc::new(sent);
    engine.register_fn("has_signal", move |name: &str| sent.contains(name));

    let awaited = Arc::clone(&calls);
    engine.register_fn("ready_for_signal", move |name: &str| {
        if let Ok(mut calls) = awaited.lock() {
            calls.awaited.push(name.to_string());
        }
    });
    let removed = Arc::clone(&calls);
    engine.register_fn("remove_signal", move |name: &str| {
        if let Ok(mut calls) = removed.lock() {
            calls.removed.push(name.to_string());
        }
    });
    calls
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Selection,
    Pre,
    Implementation,
    Post,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Selection => write!(f, "selection script"),
            Stage::Pre => write!(f, "pre script"),
            Stage::Implementation => write!(f, "implementation"),
            Stage::Post => write!(f, "post script"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LocalExecutor {
    limits: ScriptLimits,
}

impl LocalExecutor {
    pub fn new(limits: ScriptLimits) -> Self {
        Self { limits }
    }
}

impl Default for LocalExecutor {
    /// No deadline and no operation budget: tasks run until they finish or
    /// are canceled.
    fn default() -> Self {
        Self::new(ScriptLimits {
            timeout: Duration::ZERO,
            max_operations: 0,
            ..ScriptLimits::default()
        })
    }
}

impl TaskExecutor for LocalExecutor {
    fn execute(&self, assignment: Assignment, cancel: CancellationToken) -> BoxFuture<'static, TaskOutcome> {
        let limits = self.limits.clone();
        async move {
            let label = assignment.task_name.clone();
            match blocking(move || Ok(run_scripts(&limits, assignment, cancel))).await {
                Ok(outcome) => outcome,
                Err(e) => TaskOutcome::failed(format!("{}: {}", label, e)),
            }
        }
        .boxed()
    }
}

fn run_scripts(limits: &ScriptLimits, assignment: Assignment, cancel: CancellationToken) -> TaskOutcome {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let mut engine = limits.engine(Some(cancel.clone()));
    let printed = Arc::clone(&lines);
    engine.on_print(move |s| {
        if let Ok(mut lines) = printed.lock() {
            lines.push(s.to_string());
        }
    });
    let signal_calls = register_signal_api(&mut engine, assignment.signals.clone());

    let mut scope = match build_scope(&assignment) {
        Ok(scope) => scope,
        Err(e) => return TaskOutcome::failed(e.to_string()),
    };

    let fail = |stage: Stage, e: Box<EvalAltResult>| {
        if cancel.is_cancelled() {
            TaskOutcome::Canceled
        } else {
            TaskOutcome::failed(format!("{} failed: {}", stage, describe_error(&e)))
        }
    };

    if let Some(selection) = &assignment.selection_script {
        match engine.eval_with_scope::<Dynamic>(&mut scope, selection) {
            Ok(value) => match value.as_bool() {
                Ok(true) => {}
                Ok(false) => return TaskOutcome::failed("selection script rejected the task"),
                Err(type_name) => {
                    return TaskOutcome::failed(format!(
                        "selection script must return a boolean, got {}",
                        type_name
                    ))
                }
            },
            Err(e) => return fail(Stage::Selection, e),
        }
    }

    if let Some(pre) = &assignment.pre_script {
        if let Err(e) = engine.run_with_scope(&mut scope, pre) {
            return fail(Stage::Pre, e);
        }
    }

    let source = substitute(&assignment.implementation, &assignment.variables);
    flog_trace!("running {} ({} bytes)", assignment.task_name, source.len());
    let returned = match engine.eval_with_scope::<Dynamic>(&mut scope, &source) {
        Ok(value) => value,
        Err(e) => return fail(Stage::Implementation, e),
    };

    if let Some(post) = &assignment.post_script {
        if let Err(e) = engine.run_with_scope(&mut scope, post) {
            return fail(Stage::Post, e);
        }
    }

    let output = lines.lock().map(|l| l.clone()).unwrap_or_default();
    match collect(&scope, &assignment, returned, output) {
        Ok(mut output) => {
            if let Ok(mut calls) = signal_calls.lock() {
                output.awaited_signals = std::mem::take(&mut calls.awaited);
                output.removed_signals = std::mem::take(&mut calls.removed);
            }
            flog_debug!(
                "{} finished with {} variable writes",
                assignment.task_name,
                output.variables.len()
            );
            TaskOutcome::Finished(output)
        }
        Err(e) => TaskOutcome::failed(e.to_string()),
    }
}

fn to_dynamic<T: serde::Serialize>(value: &T) -> Result<Dynamic> {
    rhai::serde::to_dynamic(value).map_err(|e| Error::Validation(e.to_string()))
}

fn build_scope(assignment: &Assignment) -> Result<Scope<'static>> {
    let mut variables = Map::new();
    for (key, value) in &assignment.variables {
        variables.insert(key.clone().into(), Dynamic::from(value.clone()));
    }

    let mut scope = Scope::new();
    scope.push("variables", variables);
    scope.push_constant_dynamic("results", to_dynamic(&assignment.results)?);
    scope.push_constant_dynamic("inputs", to_dynamic(&assignment.result_map)?);
    scope.push_dynamic("result", Dynamic::UNIT);
    scope.push("result_map", Map::new());
    scope.push("signals", Array::new());
    scope.push_constant("iteration", assignment.iteration as i64);
    scope.push_constant_dynamic(
        "replication",
        assignment
            .replica
            .map(|r| Dynamic::from(r as i64))
            .unwrap_or(Dynamic::UNIT),
    );
    Ok(scope)
}

fn collect(
    scope: &Scope,
    assignment: &Assignment,
    returned: Dynamic,
    output: Vec<String>,
) -> Result<TaskOutput> {
    let from_dynamic =
        |value: &Dynamic| rhai::serde::from_dynamic::<Value>(value).map_err(|e| Error::Validation(e.to_string()));

    let bound = scope.get_value::<Dynamic>("result").unwrap_or(Dynamic::UNIT);
    let result = if bound.is_unit() { returned } else { bound };

    let mut result_map = BTreeMap::new();
    for (key, value) in scope.get_value::<Map>("result_map").unwrap_or_default() {
        result_map.insert(key.to_string(), from_dynamic(&value)?);
    }

    let mut variables = BTreeMap::new();
    for (key, value) in scope.get_value::<Map>("variables").unwrap_or_default() {
        let value = value.to_string();
        if assignment.variables.get(key.as_str()) != Some(&value) {
            variables.insert(key.to_string(), value);
        }
    }

    let signals = scope
        .get_value::<Array>("signals")
        .unwrap_or_default()
        .into_iter()
        .filter_map(|s| s.into_string().ok())
        .collect();

    Ok(TaskOutput {
        result: from_dynamic(&result)?,
        result_map,
        variables,
        signals,
        output,
        ..TaskOutput::default()
    })
}
