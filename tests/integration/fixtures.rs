//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Predefined jobs for each control-flow construct
//! - Mock executors (echo, failing, randomly delayed)
//! - A synchronous driver that completes ready instances in random order

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;

use flowsched::core::{FlowBlock, FlowScript, Job, Task};
use flowsched::execution::{
    Assignment, FnExecutor, JobReport, JobRun, Scheduler, TaskExecutor, TaskOutcome,
};
use flowsched::flow::RhaiEvaluator;
use flowsched::Config;

/// Create a task with an empty implementation.
pub fn task(name: &str) -> Task {
    Task::new(name, "")
}

/// Build a job from tasks and `(task, depends_on)` pairs.
pub fn job_with(name: &str, tasks: Vec<Task>, deps: &[(&str, &str)]) -> Job {
    let mut job = Job::new(name);
    for task in tasks {
        job.add_task(task).expect("Failed to add task");
    }
    for (task, depends_on) in deps {
        job.add_dependency(task, depends_on)
            .expect("Failed to add dependency");
    }
    job
}

/// a -> {b, c} -> d
pub fn diamond_job() -> Job {
    job_with(
        "diamond",
        vec![task("a"), task("b"), task("c"), task("d")],
        &[("b", "a"), ("c", "a"), ("d", "b"), ("d", "c")],
    )
}

/// `condition` chooses between `task_if` and `task_else`, then `task_continuation`.
pub fn branch_job(script: &str) -> Job {
    job_with(
        "branch",
        vec![
            task("condition").with_flow_script(FlowScript::branch(
                script,
                "task_if",
                "task_else",
                "task_continuation",
            )),
            task("task_if"),
            task("task_else"),
            task("task_continuation"),
        ],
        &[],
    )
}

/// `start` -> `end`, looping back to `start` while the script says so.
pub fn loop_job(script: &str) -> Job {
    job_with(
        "loop",
        vec![
            task("start").with_flow_block(FlowBlock::Start),
            task("end")
                .with_flow_block(FlowBlock::End)
                .with_flow_script(FlowScript::looping(script, "start")),
        ],
        &[("end", "start")],
    )
}

/// `split` replicates `process`; `merge` joins the replicas.
pub fn replicate_job(script: &str) -> Job {
    job_with(
        "replicate",
        vec![
            task("split")
                .with_flow_block(FlowBlock::Start)
                .with_flow_script(FlowScript::replicate(script)),
            task("process"),
            task("merge").with_flow_block(FlowBlock::End),
        ],
        &[("process", "split"), ("merge", "process")],
    )
}

/// A loop around a branch followed by a replicated block.
pub fn three_controls_job(branch: &str, runs: u32, loop_script: &str) -> Job {
    job_with(
        "three_controls",
        vec![
            task("start").with_flow_block(FlowBlock::Start),
            task("condition").with_flow_script(FlowScript::branch(
                &format!("branch = \"{}\";", branch),
                "task_if",
                "task_else",
                "continuation",
            )),
            task("task_if"),
            task("task_else"),
            task("continuation"),
            task("split")
                .with_flow_block(FlowBlock::Start)
                .with_flow_script(FlowScript::replicate(&format!("runs = {};", runs))),
            task("process"),
            task("merge").with_flow_block(FlowBlock::End),
            task("end")
                .with_flow_block(FlowBlock::End)
                .with_flow_script(FlowScript::looping(loop_script, "start")),
        ],
        &[
            ("condition", "start"),
            ("split", "continuation"),
            ("process", "split"),
            ("merge", "process"),
            ("end", "merge"),
        ],
    )
}

/// Path of a bundled demo descriptor.
pub fn demo_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("demos")
        .join(format!("{}.toml", name))
}

/// Executor that finishes every instance with its task name.
pub fn echo_executor() -> Arc<dyn TaskExecutor> {
    Arc::new(FnExecutor::new(|a: Assignment, _cancel| {
        async move { TaskOutcome::finished(json!(a.task_name)) }.boxed()
    }))
}

/// Executor that fails instances of `failing` and finishes everything else.
pub fn failing_executor(failing: &'static str) -> Arc<dyn TaskExecutor> {
    Arc::new(FnExecutor::new(move |a: Assignment, _cancel| {
        async move {
            if a.task_name == failing {
                TaskOutcome::failed(format!("{} exploded", a.task_name))
            } else {
                TaskOutcome::finished(json!(a.task_name))
            }
        }
        .boxed()
    }))
}

/// Executor that finishes after a short random delay, so completions
/// arrive in arbitrary order. Counts dispatches.
pub struct DelayedExecutor {
    max_delay_ms: u64,
    pub dispatched: Arc<AtomicUsize>,
}

impl DelayedExecutor {
    pub fn new(max_delay_ms: u64) -> Self {
        Self {
            max_delay_ms,
            dispatched: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl TaskExecutor for DelayedExecutor {
    fn execute(
        &self,
        assignment: Assignment,
        cancel: tokio_util::sync::CancellationToken,
    ) -> futures::future::BoxFuture<'static, TaskOutcome> {
        self.dispatched.fetch_add(1, Ordering::SeqCst);
        let delay = rand::thread_rng().gen_range(0..=self.max_delay_ms);
        async move {
            tokio::select! {
                _ = cancel.cancelled() => TaskOutcome::Canceled,
                _ = tokio::time::sleep(Duration::from_millis(delay)) => {
                    TaskOutcome::finished(json!(assignment.variables["TASK_REPLICATION"]))
                }
            }
        }
        .boxed()
    }
}

/// Run a job to completion on the scheduler.
pub async fn run_with(job: Job, executor: Arc<dyn TaskExecutor>) -> JobReport {
    Scheduler::new(job, &Config::default(), executor)
        .expect("Failed to create scheduler")
        .run()
        .await
        .expect("Scheduler run failed")
}

/// Synchronous driver over a [`JobRun`] evaluating flow scripts with rhai.
///
/// Each round takes every ready instance, shuffles them and reports the
/// outcome chosen by `outcome`.
pub struct Driver {
    pub run: JobRun,
    rng: StdRng,
    pub rounds: usize,
}

impl Driver {
    pub fn new(job: Job) -> Self {
        Self::with_config(job, &Config::default())
    }

    pub fn with_config(job: Job, config: &Config) -> Self {
        let run = JobRun::new(job, config, Arc::new(RhaiEvaluator::default()))
            .expect("Failed to create job run");
        Self {
            run,
            rng: StdRng::seed_from_u64(7),
            rounds: 0,
        }
    }

    pub fn seeded(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn start(&mut self) {
        self.run.start().expect("Failed to start job");
    }

    /// Complete one shuffled round of ready instances. Returns the task
    /// names that ran.
    pub fn round<F>(&mut self, outcome: &F) -> Vec<String>
    where
        F: Fn(&Assignment) -> TaskOutcome,
    {
        let mut batch = self.run.take_ready(usize::MAX).expect("take_ready failed");
        batch.shuffle(&mut self.rng);
        let names = batch.iter().map(|a| a.task_name.clone()).collect();
        for a in batch {
            self.run
                .on_report(a.instance, outcome(&a))
                .expect("on_report failed");
        }
        self.rounds += 1;
        names
    }

    /// Start and run rounds until no instance is ready.
    pub fn run_to_end<F>(&mut self, outcome: F) -> JobReport
    where
        F: Fn(&Assignment) -> TaskOutcome,
    {
        self.start();
        while !self.run.is_terminal() && self.run.has_ready() {
            self.round(&outcome);
        }
        self.run.report()
    }

    /// Start and finish every instance with its task name.
    pub fn finish_all(&mut self) -> JobReport {
        self.run_to_end(|a| TaskOutcome::finished(json!(a.task_name)))
    }
}
