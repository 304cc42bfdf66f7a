use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Duplicate task name: {0}")]
    DuplicateTaskName(String),

    #[error("Unknown task: {0}")]
    UnknownTask(String),

    #[error("Adding dependency {task} -> {depends_on} would create a cycle")]
    CycleDetected { task: String, depends_on: String },

    #[error("Invalid flow script on {task}: {reason}")]
    InvalidFlowScript { task: String, reason: String },

    #[error("Flow script error on {task}: {reason}")]
    FlowScriptError { task: String, reason: String },

    #[error("Graph expansion limit exceeded ({limit} instances)")]
    GraphExpansionLimitExceeded { limit: usize },

    #[error("Task {task} failed: {reason}")]
    TaskExecutionFailure { task: String, reason: String },

    #[error("Unknown task instance: {0}")]
    UnknownInstance(usize),

    #[error("Invalid job state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Worker pool is full (max: {max})")]
    WorkerPoolFull { max: usize },

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

pub type Result<T> = std::result::Result<T, Error>;
