//! Coordinator state for one job.
//!
//! `JobRun` owns the execution graph and the variable store and is driven
//! one report at a time, so graph mutation never races. The async
//! [`Scheduler`](crate::execution::Scheduler) wraps it; tests drive it
//! directly.

use crate::config::Config;
use crate::core::blocks::FlowPlan;
use crate::core::job::{Job, JobState, JobStatus};
use crate::core::task::{ErrorPolicy, Task, TaskId};
use crate::error::{Error, Result};
use crate::execution::executor::{Assignment, TaskOutcome, TaskOutput};
use crate::execution::expander::Expander;
use crate::execution::graph::ExecutionGraph;
use crate::execution::instance::{FailureKind, InstanceId, InstanceStatus, TaskError, TaskInstance};
use crate::flow::{ScriptEvaluator, ScriptScope};
use crate::store::VariableStore;
use crate::{flog, flog_debug, flog_error, flog_warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

pub struct JobRun {
    job: Job,
    plan: FlowPlan,
    graph: ExecutionGraph,
    store: VariableStore,
    evaluator: Arc<dyn ScriptEvaluator>,
    state: JobState,
    default_policy: ErrorPolicy,
    ready: VecDeque<InstanceId>,
    error: Option<String>,
}

impl JobRun {
    /// Validate `job` and prepare it for execution.
    ///
    /// # Errors
    /// Any construction error of the job's graph or flow scripts.
    pub fn new(job: Job, config: &Config, evaluator: Arc<dyn ScriptEvaluator>) -> Result<Self> {
        let plan = job.validate()?;
        let store = VariableStore::new(job.variables.clone());
        flog_debug!(
            "job {} validated: {} tasks, {} branches, {} loops, {} replicates",
            job.name,
            job.graph.task_count(),
            plan.branch_count(),
            plan.loop_count(),
            plan.replicate_count()
        );
        Ok(Self {
            job,
            plan,
            graph: ExecutionGraph::new(config.max_instances),
            store,
            evaluator,
            state: JobState::new(),
            default_policy: config.default_error_policy,
            ready: VecDeque::new(),
            error: None,
        })
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn plan(&self) -> &FlowPlan {
        &self.plan
    }

    pub fn graph(&self) -> &ExecutionGraph {
        &self.graph
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn status(&self) -> JobStatus {
        self.state.status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.status().is_terminal()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn running_count(&self) -> usize {
        self.graph.count(InstanceStatus::Running)
    }

    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Create the root instances and move the job to RUNNING.
    pub fn start(&mut self) -> Result<()> {
        self.state.transition(JobStatus::Running)?;
        flog!("job {} ({}) started", self.job.name, self.job.id.short());
        self.expand(|expander| expander.seed())?;
        self.check_completion()
    }

    /// Hand out up to `limit` ready instances, marking them RUNNING.
    pub fn take_ready(&mut self, limit: usize) -> Result<Vec<Assignment>> {
        let mut assignments = Vec::new();
        if self.is_terminal() {
            return Ok(assignments);
        }
        while assignments.len() < limit {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let instance = self.graph.instance_mut(id)?;
            if instance.status != InstanceStatus::Ready {
                continue;
            }
            instance.mark_running();
            let instance = instance.clone();
            assignments.push(self.assignment(&instance)?);
        }
        Ok(assignments)
    }

    /// Apply an executor report for a running instance.
    ///
    /// Reports for instances that are no longer running (the job was
    /// canceled or failed meanwhile) are discarded.
    pub fn on_report(&mut self, id: InstanceId, outcome: TaskOutcome) -> Result<()> {
        let instance = self.graph.instance(id)?;
        if instance.status != InstanceStatus::Running {
            flog_debug!(
                "discarding report for {} {} in state {}",
                id,
                instance.label(),
                instance.status
            );
            return Ok(());
        }
        match outcome {
            TaskOutcome::Finished(output) => self.on_finished(id, output),
            TaskOutcome::Failed { error } => self.on_failed(
                id,
                TaskError {
                    kind: FailureKind::TaskExecution,
                    message: error,
                },
            ),
            TaskOutcome::Canceled => {
                let label = instance.label();
                self.graph.instance_mut(id)?.finish(InstanceStatus::Canceled);
                flog_warn!("instance {} {} canceled by its executor", id, label);
                self.cancel()
            }
        }
    }

    /// Cancel the job: every non-terminal instance becomes CANCELED.
    pub fn cancel(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        self.state.transition(JobStatus::Canceled)?;
        let canceled = self.cancel_remaining();
        flog!("job {} canceled ({} instances)", self.job.name, canceled);
        Ok(())
    }

    /// Fail the job, canceling whatever has not finished yet.
    pub fn fail(&mut self, reason: String) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        flog_error!("job {} failed: {}", self.job.name, reason);
        self.error = Some(reason);
        if self.state.status() == JobStatus::Submitted {
            self.state.transition(JobStatus::Running)?;
        }
        self.state.transition(JobStatus::Failed)?;
        self.cancel_remaining();
        Ok(())
    }

    fn on_finished(&mut self, id: InstanceId, output: TaskOutput) -> Result<()> {
        let instance = self.graph.instance(id)?.clone();
        let task_id = instance
            .task_id()
            .ok_or(Error::UnknownInstance(id.0))?;
        let task = self
            .job
            .graph
            .get(&task_id)
            .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;

        let label = instance.label();
        self.store
            .set_result(id, &label, output.result.clone(), task.precious_result);
        for (key, value) in &output.result_map {
            self.store.put_result(id, key, value.clone());
        }
        for (key, value) in &output.variables {
            self.store.put_job_variable(key, value);
        }
        for signal in &output.awaited_signals {
            self.store.ready_for_signal(signal);
        }
        for signal in &output.signals {
            self.store.send_signal(signal);
        }
        for signal in &output.removed_signals {
            if !self.store.remove_signal(signal) {
                flog_debug!("{} removed signal {} that was never sent", label, signal);
            }
        }
        if !output.output.is_empty() {
            self.store.append_output(id, output.output.clone());
        }

        let decision = match &task.flow_script {
            None => Ok(None),
            Some(script) => {
                let scope = self.script_scope(&instance, task, &output.result);
                self.evaluator
                    .evaluate(script.kind(), script.source(), &scope)
                    .and_then(|decision| {
                        if decision.kind() == script.kind() {
                            Ok(Some(decision))
                        } else {
                            Err(Error::FlowScriptError {
                                task: task.name.clone(),
                                reason: format!("expected a {} decision, got {}", script.kind(), decision),
                            })
                        }
                    })
            }
        };
        let is_merge = self.plan.is_merge(&task_id);

        let decision = match decision {
            Ok(decision) => decision,
            Err(e) => {
                let message = match e {
                    Error::FlowScriptError { reason, .. } => reason,
                    other => other.to_string(),
                };
                return self.on_failed(
                    id,
                    TaskError {
                        kind: FailureKind::FlowScript,
                        message,
                    },
                );
            }
        };

        {
            let instance = self.graph.instance_mut(id)?;
            instance.error = None;
            instance.finish(InstanceStatus::Finished);
        }
        match decision {
            Some(decision) => flog_debug!("instance {} {} finished, {}", id, label, decision),
            None => flog_debug!("instance {} {} finished", id, label),
        }

        match self.expand(|expander| expander.on_finished(id, decision)) {
            Ok(()) => {}
            Err(e @ Error::GraphExpansionLimitExceeded { .. }) => {
                let message = e.to_string();
                self.graph.instance_mut(id)?.fail(TaskError {
                    kind: FailureKind::ExpansionLimit,
                    message: message.clone(),
                });
                return self.fail(format!("{}: {}", label, message));
            }
            Err(e) => return Err(e),
        }

        if is_merge {
            self.release_replicas(id);
        }
        self.check_completion()
    }

    fn on_failed(&mut self, id: InstanceId, error: TaskError) -> Result<()> {
        let policy = self.policy_for(id)?;
        let instance = self.graph.instance_mut(id)?;
        let label = instance.label();

        if let ErrorPolicy::Retry { max_attempts } = policy {
            if instance.attempts < max_attempts {
                flog_warn!(
                    "instance {} {} failed (attempt {}/{}), retrying: {}",
                    id,
                    label,
                    instance.attempts,
                    max_attempts,
                    error
                );
                instance.error = Some(error);
                instance.status = InstanceStatus::Ready;
                self.ready.push_back(id);
                return Ok(());
            }
        }

        flog_warn!("instance {} {} failed: {}", id, label, error);
        let reason = format!("{} failed: {}", label, error);
        instance.fail(error);

        match policy {
            ErrorPolicy::ContinueJobExecution => {
                self.expand(|expander| expander.on_failed(id))?;
                self.check_completion()
            }
            ErrorPolicy::CancelJob | ErrorPolicy::Retry { .. } => self.fail(reason),
        }
    }

    fn policy_for(&self, id: InstanceId) -> Result<ErrorPolicy> {
        let instance = self.graph.instance(id)?;
        let task = instance
            .task_id()
            .and_then(|t| self.job.graph.get(&t))
            .ok_or(Error::UnknownInstance(id.0))?;
        Ok(self.job.error_policy_for(task, self.default_policy))
    }

    /// Run `f` against an expander over this job and queue what opened.
    fn expand<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Expander<'_>) -> Result<()>,
    {
        let mut expander = Expander::new(&self.job.graph, &self.plan, &mut self.graph);
        let result = f(&mut expander);
        self.ready.extend(expander.into_ready());
        result
    }

    fn release_replicas(&mut self, merge: InstanceId) {
        let mut released = 0;
        for dep in self.graph.dependencies(merge) {
            if !self.graph.get(dep).is_some_and(|i| i.is_join()) {
                continue;
            }
            for replica in self.graph.replica_instances(dep) {
                if self.store.release(&replica) {
                    released += 1;
                }
            }
        }
        flog_debug!("released {} replica results at {}", released, merge);
    }

    fn cancel_remaining(&mut self) -> usize {
        self.ready.clear();
        let open: Vec<InstanceId> = self
            .graph
            .instances()
            .filter(|i| !i.status.is_terminal())
            .map(|i| i.id)
            .collect();
        for id in &open {
            if let Some(instance) = self.graph.get_mut(*id) {
                instance.finish(InstanceStatus::Canceled);
            }
        }
        open.len()
    }

    fn check_completion(&mut self) -> Result<()> {
        if self.is_terminal() {
            return Ok(());
        }
        let active = self.graph.count(InstanceStatus::Ready) + self.graph.count(InstanceStatus::Running);
        if active > 0 {
            return Ok(());
        }
        let pending = self.graph.count(InstanceStatus::Pending);
        if pending > 0 {
            return self.fail(format!("{} instances can never become ready", pending));
        }

        let failed = self.graph.count(InstanceStatus::Failed);
        if failed > 0 {
            self.error
                .get_or_insert_with(|| format!("{} task instances failed", failed));
            self.state.transition(JobStatus::Failed)?;
            flog!("job {} finished with {} failed instances", self.job.name, failed);
        } else {
            self.state.transition(JobStatus::Finished)?;
            flog!(
                "job {} finished: {} instances",
                self.job.name,
                self.graph.len()
            );
        }
        Ok(())
    }

    fn system_variables(&self, instance: &TaskInstance, task: &Task) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("TASK_NAME".to_string(), task.name.clone()),
            ("TASK_ID".to_string(), task.id.to_string()),
            ("TASK_ITERATION".to_string(), instance.iteration.to_string()),
            (
                "TASK_REPLICATION".to_string(),
                instance.replica.unwrap_or(0).to_string(),
            ),
            ("JOB_NAME".to_string(), self.job.name.clone()),
            ("JOB_ID".to_string(), self.job.id.to_string()),
        ])
    }

    fn script_scope(&self, instance: &TaskInstance, task: &Task, result: &Value) -> ScriptScope {
        let mut scope = ScriptScope::new(&task.name);
        scope.job = self.store.job_variables().clone();
        scope.task = task.variables.clone();
        scope.system = self.system_variables(instance, task);
        scope.iteration = instance.iteration;
        scope.replication = instance.replica;
        scope.result = result.clone();
        scope
    }

    fn assignment(&self, instance: &TaskInstance) -> Result<Assignment> {
        let task = instance
            .task_id()
            .and_then(|t| self.job.graph.get(&t))
            .ok_or(Error::UnknownInstance(instance.id.0))?;
        let sources = self.graph.result_sources(instance.id);

        let mut variables = self.store.job_variables().clone();
        variables.extend(task.variables.clone());
        variables.extend(self.system_variables(instance, task));

        Ok(Assignment {
            instance: instance.id,
            task_name: task.name.clone(),
            job_name: self.job.name.clone(),
            implementation: task.implementation.clone(),
            selection_script: task.selection_script.clone(),
            pre_script: task.pre_script.clone(),
            post_script: task.post_script.clone(),
            variables,
            results: self.store.results_of(&sources),
            result_map: self.store.entries_of(&sources),
            signals: self.store.signals().clone(),
            iteration: instance.iteration,
            replica: instance.replica,
            attempt: instance.attempts,
        })
    }

    /// Snapshot of the job's state and results.
    pub fn report(&self) -> JobReport {
        JobReport {
            job_id: self.job.id.to_string(),
            job_name: self.job.name.clone(),
            status: self.status(),
            error: self.error.clone(),
            instances: self.graph.instances().map(InstanceSummary::from).collect(),
            result_map: self.store.job_result_map(),
            precious_results: self.store.precious_results(),
            variables: self.store.job_variables().clone(),
            output: self.store.output(),
            signals: self.store.signals().iter().cloned().collect(),
            awaited_signals: self.store.awaited_signals().iter().cloned().collect(),
        }
    }

    /// Instances of the task named `name`.
    pub fn instances_named(&self, name: &str) -> Vec<&TaskInstance> {
        match self.job.graph.id_of(name) {
            Some(id) => self.graph.instances_of(&id),
            None => Vec::new(),
        }
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.job.graph.id_of(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub label: String,
    /// `None` for join points.
    pub task: Option<String>,
    pub iteration: u32,
    pub replica: Option<u32>,
    pub status: InstanceStatus,
    pub attempts: u32,
    pub error: Option<String>,
}

impl From<&TaskInstance> for InstanceSummary {
    fn from(instance: &TaskInstance) -> Self {
        Self {
            id: instance.id,
            label: instance.label(),
            task: instance.task_name().map(str::to_string),
            iteration: instance.iteration,
            replica: instance.replica,
            status: instance.status,
            attempts: instance.attempts,
            error: instance.error.as_ref().map(|e| e.to_string()),
        }
    }
}

/// Final (or current) outcome of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: String,
    pub job_name: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub instances: Vec<InstanceSummary>,
    /// Keyed entries of precious results.
    pub result_map: BTreeMap<String, Value>,
    /// Main values of precious results by instance label.
    pub precious_results: BTreeMap<String, Value>,
    pub variables: BTreeMap<String, String>,
    pub output: BTreeMap<String, Vec<String>>,
    /// Signals sent and not yet consumed.
    pub signals: Vec<String>,
    /// Signals the job declared itself ready for that were never sent.
    pub awaited_signals: Vec<String>,
}

impl JobReport {
    pub fn instances_of(&self, task: &str) -> Vec<&InstanceSummary> {
        self.instances
            .iter()
            .filter(|i| i.task.as_deref() == Some(task))
            .collect()
    }

    /// Number of instances of `task` in `status`.
    pub fn count(&self, task: &str, status: InstanceStatus) -> usize {
        self.instances_of(task)
            .iter()
            .filter(|i| i.status == status)
            .count()
    }
}
