//! Job scheduler.
//!
//! The `Scheduler` is the coordinator actor of one job. It owns the
//! [`JobRun`], dispatches READY instances to the [`WorkerPool`] and applies
//! worker reports one at a time:
//!
//! 1. Dispatch ready instances while the pool has capacity
//! 2. Wait for a worker report or a cancel request
//! 3. Apply the report (results, flow decision, expansion)
//! 4. Repeat until the job is terminal, then cancel and drain the workers

use crate::config::Config;
use crate::core::job::{Job, JobStatus};
use crate::error::{Error, Result};
use crate::execution::executor::TaskExecutor;
use crate::execution::instance::{InstanceId, InstanceStatus};
use crate::execution::pool::{WorkerPool, WorkerReport};
use crate::execution::run::{JobReport, JobRun};
use crate::flow::{RhaiEvaluator, ScriptEvaluator};
use crate::{flog_debug, flog_error};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Events emitted by the scheduler while a job runs.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerEvent {
    JobStarted { job: String },
    /// An instance was handed to a worker.
    InstanceStarted { instance: InstanceId, label: String },
    /// A worker reported; `status` is the instance status afterwards.
    InstanceReported {
        instance: InstanceId,
        label: String,
        status: InstanceStatus,
    },
    JobFinished { status: JobStatus },
}

pub struct Scheduler {
    run: JobRun,
    pool: WorkerPool,
    reports: mpsc::Receiver<WorkerReport>,
    cancel: CancellationToken,
    status_tx: watch::Sender<JobStatus>,
    event_tx: Option<mpsc::Sender<SchedulerEvent>>,
}

impl Scheduler {
    /// Create a scheduler evaluating flow scripts with rhai.
    ///
    /// # Errors
    /// Returns the job's construction error if it does not validate.
    pub fn new(job: Job, config: &Config, executor: Arc<dyn TaskExecutor>) -> Result<Self> {
        let evaluator = Arc::new(RhaiEvaluator::new(config.script_limits()));
        Self::with_evaluator(job, config, executor, evaluator)
    }

    pub fn with_evaluator(
        job: Job,
        config: &Config,
        executor: Arc<dyn TaskExecutor>,
        evaluator: Arc<dyn ScriptEvaluator>,
    ) -> Result<Self> {
        let run = JobRun::new(job, config, evaluator)?;
        let cancel = CancellationToken::new();
        let (report_tx, reports) = mpsc::channel(config.max_workers.max(1) * 2);
        let pool = WorkerPool::new(executor, config.max_workers, report_tx, cancel.child_token());
        let (status_tx, _) = watch::channel(run.status());
        Ok(Self {
            run,
            pool,
            reports,
            cancel,
            status_tx,
            event_tx: None,
        })
    }

    /// Emit [`SchedulerEvent`]s on `event_tx`. The receiver must keep up:
    /// a full channel stalls the scheduler.
    pub fn with_events(mut self, event_tx: mpsc::Sender<SchedulerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<JobStatus> {
        self.status_tx.subscribe()
    }

    /// Run the job on a new tokio task.
    pub fn spawn(self) -> JobHandle {
        let cancel = self.cancel.clone();
        let status = self.subscribe();
        let task = tokio::spawn(self.run());
        JobHandle {
            cancel,
            status,
            task,
        }
    }

    /// Run the job to completion and return its report.
    pub async fn run(mut self) -> Result<JobReport> {
        self.emit(SchedulerEvent::JobStarted {
            job: self.run.job().name.clone(),
        })
        .await;

        if let Err(e) = self.drive().await {
            flog_error!("scheduler error: {}", e);
            self.run.fail(e.to_string())?;
        }
        self.shutdown().await?;
        self.publish();

        let report = self.run.report();
        self.emit(SchedulerEvent::JobFinished {
            status: report.status,
        })
        .await;
        Ok(report)
    }

    async fn drive(&mut self) -> Result<()> {
        self.run.start()?;
        self.publish();

        let cancel = self.cancel.clone();
        loop {
            self.dispatch_ready().await?;
            if self.run.is_terminal() {
                return Ok(());
            }
            if self.pool.active_count() == 0 {
                return Err(Error::Validation(
                    "job has no runnable instances left".to_string(),
                ));
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    flog_debug!("cancel requested for job {}", self.run.job().name);
                    self.run.cancel()?;
                }
                report = self.reports.recv() => match report {
                    Some(report) => self.handle_report(report).await?,
                    None => return Err(Error::Validation("worker channel closed".to_string())),
                },
            }
            self.publish();
        }
    }

    /// Dispatch ready instances to free workers. Returns how many started.
    async fn dispatch_ready(&mut self) -> Result<usize> {
        let assignments = self.run.take_ready(self.pool.available())?;
        let dispatched = assignments.len();
        for assignment in assignments {
            let instance = assignment.instance;
            let label = self.label(instance);
            self.pool.spawn(assignment)?;
            flog_debug!("dispatched {} {}", instance, label);
            self.emit(SchedulerEvent::InstanceStarted { instance, label })
                .await;
        }
        Ok(dispatched)
    }

    async fn handle_report(&mut self, report: WorkerReport) -> Result<()> {
        let WorkerReport { instance, outcome } = report;
        self.pool.finish(&instance);
        self.run.on_report(instance, outcome)?;

        let status = self
            .run
            .graph()
            .get(instance)
            .map(|i| i.status)
            .unwrap_or_default();
        let label = self.label(instance);
        self.emit(SchedulerEvent::InstanceReported {
            instance,
            label,
            status,
        })
        .await;
        Ok(())
    }

    /// Cancel whatever is still running and wait for the workers to report.
    async fn shutdown(&mut self) -> Result<()> {
        if self.pool.active_count() == 0 {
            return Ok(());
        }
        flog_debug!("draining {} workers", self.pool.active_count());
        self.pool.cancel_all();
        while self.pool.active_count() > 0 {
            let Some(WorkerReport { instance, outcome }) = self.reports.recv().await else {
                break;
            };
            self.pool.finish(&instance);
            self.run.on_report(instance, outcome)?;
        }
        Ok(())
    }

    fn label(&self, instance: InstanceId) -> String {
        self.run
            .graph()
            .get(instance)
            .map(|i| i.label())
            .unwrap_or_else(|| instance.to_string())
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.run.status());
    }

    async fn emit(&self, event: SchedulerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}

/// Handle to a job running on its own task.
pub struct JobHandle {
    cancel: CancellationToken,
    status: watch::Receiver<JobStatus>,
    task: JoinHandle<Result<JobReport>>,
}

impl JobHandle {
    /// Latest published status. Never blocks and never changes state.
    pub fn status(&self) -> JobStatus {
        *self.status.borrow()
    }

    /// Request cancellation; `wait` returns once workers have drained.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait until the job status satisfies `f`.
    pub async fn wait_for<F>(&mut self, f: F) -> Result<JobStatus>
    where
        F: Fn(&JobStatus) -> bool,
    {
        let status = self
            .status
            .wait_for(|s| f(s))
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?;
        Ok(*status)
    }

    pub async fn wait(self) -> Result<JobReport> {
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}
