//! Jobs and the job lifecycle.
//!
//! A `Job` owns its static task graph and job-level variables. `JobState`
//! tracks the lifecycle and rejects transitions that skip or reverse it:
//!
//! Submitted -> Running -> Finished | Failed | Canceled
//!
//! A submitted job may also be canceled before it starts.

use crate::core::blocks::FlowPlan;
use crate::core::graph::TaskGraph;
use crate::core::task::{ErrorPolicy, Task, TaskId};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Submitted,
    Running,
    Finished,
    Canceled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Canceled | JobStatus::Failed
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Submitted => write!(f, "submitted"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Finished => write!(f, "finished"),
            JobStatus::Canceled => write!(f, "canceled"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A named unit of work: a task graph plus job variables.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub graph: TaskGraph,
    /// Job-scoped variables, visible to every task instance.
    pub variables: BTreeMap<String, String>,
    /// Error policy for tasks without their own; the engine default applies
    /// when unset.
    pub on_task_error: Option<ErrorPolicy>,
}

impl Job {
    pub fn new(name: &str) -> Self {
        Self {
            id: JobId::new(),
            name: name.to_string(),
            graph: TaskGraph::new(),
            variables: BTreeMap::new(),
            on_task_error: None,
        }
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_task_error = Some(policy);
        self
    }

    /// Add a task to the job.
    pub fn add_task(&mut self, task: Task) -> Result<TaskId> {
        self.graph.add_task(task)
    }

    /// Declare that `task` depends on `depends_on`.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) -> Result<()> {
        self.graph.add_dependency(task, depends_on)
    }

    /// Validate the graph; fatal to submission on error.
    pub fn validate(&self) -> Result<FlowPlan> {
        if self.graph.is_empty() {
            return Err(Error::Validation(format!("job {} has no tasks", self.name)));
        }
        self.graph.validate()
    }

    /// Effective error policy for `task`.
    pub fn error_policy_for(&self, task: &Task, default: ErrorPolicy) -> ErrorPolicy {
        task.on_error.or(self.on_task_error).unwrap_or(default)
    }
}

/// A record of a status transition with timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: JobStatus,
    pub entered_at: DateTime<Utc>,
}

/// Job lifecycle with transition validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    status: JobStatus,
    history: Vec<StatusHistoryEntry>,
}

impl JobState {
    pub fn new() -> Self {
        Self {
            status: JobStatus::Submitted,
            history: vec![StatusHistoryEntry {
                status: JobStatus::Submitted,
                entered_at: Utc::now(),
            }],
        }
    }

    pub fn can_transition(&self, target: JobStatus) -> bool {
        matches!(
            (self.status, target),
            (JobStatus::Submitted, JobStatus::Running)
                | (JobStatus::Submitted, JobStatus::Canceled)
                | (JobStatus::Running, JobStatus::Finished)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Canceled)
        )
    }

    /// Move to `target`, failing with `InvalidStateTransition` when the
    /// lifecycle does not allow it.
    pub fn transition(&mut self, target: JobStatus) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: target.to_string(),
            });
        }

        self.status = target;
        self.history.push(StatusHistoryEntry {
            status: target,
            entered_at: Utc::now(),
        });
        Ok(())
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn history(&self) -> &[StatusHistoryEntry] {
        &self.history
    }
}

impl Default for JobState {
    fn default() -> Self {
        Self::new()
    }
}
