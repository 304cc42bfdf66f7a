//! Runtime task instances.
//!
//! Every loop iteration and every replica produces fresh instances, so a
//! single `Task` may have many instances, each tagged with its iteration
//! and replica index.

use crate::core::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Index of an instance in the execution graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub usize);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Index of an expansion frame (root, loop iteration or replica).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FrameId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Waiting for predecessors.
    #[default]
    Pending,
    Ready,
    Running,
    Finished,
    Failed,
    Canceled,
    /// Never ran because a predecessor failed or was skipped.
    Skipped,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Finished
                | InstanceStatus::Failed
                | InstanceStatus::Canceled
                | InstanceStatus::Skipped
        )
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Pending => write!(f, "pending"),
            InstanceStatus::Ready => write!(f, "ready"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Finished => write!(f, "finished"),
            InstanceStatus::Failed => write!(f, "failed"),
            InstanceStatus::Canceled => write!(f, "canceled"),
            InstanceStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Why an instance failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Reported by the executor.
    TaskExecution,
    /// The task's flow script failed.
    FlowScript,
    /// Expanding the task's flow decision would exceed the instance limit.
    ExpansionLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            FailureKind::TaskExecution => "task execution failure",
            FailureKind::FlowScript => "flow script error",
            FailureKind::ExpansionLimit => "expansion limit",
        };
        write!(f, "{}: {}", kind, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum InstanceKind {
    /// Runs a task template.
    Task { task: TaskId, name: String },
    /// Synthesized join collecting every replica in front of a merge task.
    Join {
        split: TaskId,
        merge: TaskId,
        merge_name: String,
    },
}

/// Arrival counter deciding when an instance may leave `Pending`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gate {
    pub expected: usize,
    pub arrived: usize,
    /// At least one arrival came from a failed or skipped predecessor.
    pub skipped: bool,
}

impl Gate {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            ..Self::default()
        }
    }

    pub fn is_open(&self) -> bool {
        self.arrived >= self.expected
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    pub id: InstanceId,
    pub kind: InstanceKind,
    pub frame: FrameId,
    /// 0-based loop iteration.
    pub iteration: u32,
    pub replica: Option<u32>,
    pub status: InstanceStatus,
    pub gate: Gate,
    /// Dispatches so far, retries included.
    pub attempts: u32,
    pub error: Option<TaskError>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(
        id: InstanceId,
        kind: InstanceKind,
        frame: FrameId,
        iteration: u32,
        replica: Option<u32>,
        expected: usize,
    ) -> Self {
        Self {
            id,
            kind,
            frame,
            iteration,
            replica,
            status: InstanceStatus::Pending,
            gate: Gate::new(expected),
            attempts: 0,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    /// Task template, `None` for join points.
    pub fn task_id(&self) -> Option<TaskId> {
        match &self.kind {
            InstanceKind::Task { task, .. } => Some(*task),
            InstanceKind::Join { .. } => None,
        }
    }

    pub fn task_name(&self) -> Option<&str> {
        match &self.kind {
            InstanceKind::Task { name, .. } => Some(name),
            InstanceKind::Join { .. } => None,
        }
    }

    pub fn is_join(&self) -> bool {
        matches!(self.kind, InstanceKind::Join { .. })
    }

    /// Display label: `name`, `name#2` for iteration 2, `name*1` for replica 1.
    pub fn label(&self) -> String {
        let mut label = match &self.kind {
            InstanceKind::Task { name, .. } => name.clone(),
            InstanceKind::Join { merge_name, .. } => format!("join:{}", merge_name),
        };
        if self.iteration > 0 {
            label.push_str(&format!("#{}", self.iteration));
        }
        if let Some(replica) = self.replica {
            label.push_str(&format!("*{}", replica));
        }
        label
    }

    pub fn mark_running(&mut self) {
        self.status = InstanceStatus::Running;
        self.attempts += 1;
        self.started_at = Some(Utc::now());
    }

    /// Move to a terminal status, stamping the finish time.
    pub fn finish(&mut self, status: InstanceStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: TaskError) {
        self.error = Some(error);
        self.finish(InstanceStatus::Failed);
    }
}
