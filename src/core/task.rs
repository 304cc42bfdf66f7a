//! Task templates for the static job graph.
//!
//! A `Task` is the user-declared unit of work. The engine never runs a
//! `Task` directly: it materialises one or more task instances from it
//! (one per loop iteration and per replica).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a task within a job.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Role of a task in a control-flow block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowBlock {
    #[default]
    None,
    Start,
    End,
}

impl std::fmt::Display for FlowBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowBlock::None => write!(f, "none"),
            FlowBlock::Start => write!(f, "start"),
            FlowBlock::End => write!(f, "end"),
        }
    }
}

/// The three kinds of control-flow decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    Branch,
    Loop,
    Replicate,
}

impl FlowKind {
    /// Name of the variable the decision script must bind. `loop` is
    /// reserved in rhai, so loops bind `loop_`.
    pub fn binding(&self) -> &'static str {
        match self {
            FlowKind::Branch => "branch",
            FlowKind::Loop => "loop_",
            FlowKind::Replicate => "runs",
        }
    }
}

impl std::fmt::Display for FlowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowKind::Branch => write!(f, "branch"),
            FlowKind::Loop => write!(f, "loop"),
            FlowKind::Replicate => write!(f, "replicate"),
        }
    }
}

/// Decision script attached to a task, evaluated once the task finishes.
///
/// Targets are task names within the same job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FlowScript {
    Branch {
        script: String,
        #[serde(rename = "if")]
        if_target: String,
        #[serde(rename = "else")]
        else_target: String,
        continuation: String,
    },
    Loop {
        script: String,
        target: String,
    },
    Replicate {
        script: String,
    },
}

impl FlowScript {
    pub fn branch(script: &str, if_target: &str, else_target: &str, continuation: &str) -> Self {
        FlowScript::Branch {
            script: script.to_string(),
            if_target: if_target.to_string(),
            else_target: else_target.to_string(),
            continuation: continuation.to_string(),
        }
    }

    pub fn looping(script: &str, target: &str) -> Self {
        FlowScript::Loop {
            script: script.to_string(),
            target: target.to_string(),
        }
    }

    pub fn replicate(script: &str) -> Self {
        FlowScript::Replicate {
            script: script.to_string(),
        }
    }

    pub fn kind(&self) -> FlowKind {
        match self {
            FlowScript::Branch { .. } => FlowKind::Branch,
            FlowScript::Loop { .. } => FlowKind::Loop,
            FlowScript::Replicate { .. } => FlowKind::Replicate,
        }
    }

    pub fn source(&self) -> &str {
        match self {
            FlowScript::Branch { script, .. }
            | FlowScript::Loop { script, .. }
            | FlowScript::Replicate { script } => script,
        }
    }

    /// Names of every task this script refers to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            FlowScript::Branch {
                if_target,
                else_target,
                continuation,
                ..
            } => vec![if_target, else_target, continuation],
            FlowScript::Loop { target, .. } => vec![target],
            FlowScript::Replicate { .. } => Vec::new(),
        }
    }
}

/// What happens to the job when a task instance fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum ErrorPolicy {
    /// Abort the whole job.
    #[default]
    CancelJob,
    /// Skip work that required the failed task; independent work proceeds.
    ContinueJobExecution,
    /// Re-dispatch the same instance, then behave like `CancelJob`.
    Retry { max_attempts: u32 },
}

impl std::fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorPolicy::CancelJob => write!(f, "cancel_job"),
            ErrorPolicy::ContinueJobExecution => write!(f, "continue_job_execution"),
            ErrorPolicy::Retry { max_attempts } => write!(f, "retry({})", max_attempts),
        }
    }
}

/// A single task template in the job graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Name, unique within the job.
    pub name: String,
    /// Script source or command the executor runs.
    pub implementation: String,
    /// Block role for loop and replicate scoping.
    #[serde(default)]
    pub flow_block: FlowBlock,
    /// Control-flow decision evaluated after the task finishes.
    #[serde(default)]
    pub flow_script: Option<FlowScript>,
    /// Executor-side eligibility check.
    #[serde(default)]
    pub selection_script: Option<String>,
    #[serde(default)]
    pub pre_script: Option<String>,
    #[serde(default)]
    pub post_script: Option<String>,
    /// Task-scoped variables, visible only to this task's instances.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    /// Keep this task's results until the job result is retrieved.
    #[serde(default)]
    pub precious_result: bool,
    /// Overrides the job's error policy.
    #[serde(default)]
    pub on_error: Option<ErrorPolicy>,
}

impl Task {
    /// Create a task with the given name and implementation.
    pub fn new(name: &str, implementation: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            implementation: implementation.to_string(),
            flow_block: FlowBlock::None,
            flow_script: None,
            selection_script: None,
            pre_script: None,
            post_script: None,
            variables: BTreeMap::new(),
            precious_result: false,
            on_error: None,
        }
    }

    pub fn with_flow_block(mut self, block: FlowBlock) -> Self {
        self.flow_block = block;
        self
    }

    pub fn with_flow_script(mut self, script: FlowScript) -> Self {
        self.flow_script = Some(script);
        self
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_precious_result(mut self, precious: bool) -> Self {
        self.precious_result = precious;
        self
    }

    pub fn with_on_error(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = Some(policy);
        self
    }

    pub fn with_selection_script(mut self, script: &str) -> Self {
        self.selection_script = Some(script.to_string());
        self
    }

    pub fn with_pre_script(mut self, script: &str) -> Self {
        self.pre_script = Some(script.to_string());
        self
    }

    pub fn with_post_script(mut self, script: &str) -> Self {
        self.post_script = Some(script.to_string());
        self
    }

    pub fn is_start(&self) -> bool {
        self.flow_block == FlowBlock::Start
    }

    pub fn is_end(&self) -> bool {
        self.flow_block == FlowBlock::End
    }

    pub fn flow_kind(&self) -> Option<FlowKind> {
        self.flow_script.as_ref().map(FlowScript::kind)
    }
}
