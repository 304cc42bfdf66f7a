//! The boundary between the scheduler and whatever runs task code.

use crate::execution::instance::InstanceId;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;

/// Everything an executor needs to run one task instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub instance: InstanceId,
    pub task_name: String,
    pub job_name: String,
    pub implementation: String,
    pub selection_script: Option<String>,
    pub pre_script: Option<String>,
    pub post_script: Option<String>,
    /// Job variables, then task variables, then system variables.
    pub variables: BTreeMap<String, String>,
    /// Main results of direct predecessors, replicas in replica order.
    pub results: Vec<Value>,
    /// Keyed results of direct predecessors.
    pub result_map: BTreeMap<String, Value>,
    /// Signals sent in the job so far.
    pub signals: BTreeSet<String>,
    pub iteration: u32,
    pub replica: Option<u32>,
    /// 1 on first dispatch, incremented by retries.
    pub attempt: u32,
}

/// What a finished task hands back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    pub result: Value,
    /// Keyed entries committed with the result.
    pub result_map: BTreeMap<String, Value>,
    /// Job variable writes, applied in report arrival order.
    pub variables: BTreeMap<String, String>,
    /// Signals sent by the task.
    pub signals: Vec<String>,
    /// Signals the task declared itself ready to receive.
    pub awaited_signals: Vec<String>,
    /// Signals the task consumed.
    pub removed_signals: Vec<String>,
    /// Printed lines.
    pub output: Vec<String>,
}

impl TaskOutput {
    pub fn new(result: Value) -> Self {
        Self {
            result,
            ..Self::default()
        }
    }

    pub fn with_entry(mut self, key: &str, value: Value) -> Self {
        self.result_map.insert(key.to_string(), value);
        self
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_signal(mut self, signal: &str) -> Self {
        self.signals.push(signal.to_string());
        self
    }

    pub fn awaiting(mut self, signal: &str) -> Self {
        self.awaited_signals.push(signal.to_string());
        self
    }

    pub fn consuming(mut self, signal: &str) -> Self {
        self.removed_signals.push(signal.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Finished(TaskOutput),
    Failed { error: String },
    Canceled,
}

impl TaskOutcome {
    pub fn finished(result: Value) -> Self {
        TaskOutcome::Finished(TaskOutput::new(result))
    }

    pub fn failed(error: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: error.into(),
        }
    }
}

/// Runs task instances.
///
/// `execute` is called once per dispatch from the coordinator. The returned
/// future runs on its own tokio task and must resolve even when `cancel`
/// fires; a result produced after cancellation is discarded.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, assignment: Assignment, cancel: CancellationToken) -> BoxFuture<'static, TaskOutcome>;
}

/// Executor backed by an async closure.
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(Assignment, CancellationToken) -> BoxFuture<'static, TaskOutcome> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> TaskExecutor for FnExecutor<F>
where
    F: Fn(Assignment, CancellationToken) -> BoxFuture<'static, TaskOutcome> + Send + Sync,
{
    fn execute(&self, assignment: Assignment, cancel: CancellationToken) -> BoxFuture<'static, TaskOutcome> {
        (self.f)(assignment, cancel)
    }
}
