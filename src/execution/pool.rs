//! Worker pool for concurrent task execution.
//!
//! The `WorkerPool` runs one tokio task per dispatched instance, enforces
//! the `max_workers` limit and reports every outcome on a single channel.
//! Each worker holds a child of the pool's cancellation token; a canceled
//! worker reports `Canceled` without waiting for its executor.

use crate::error::{Error, Result};
use crate::execution::executor::{Assignment, TaskExecutor, TaskOutcome};
use crate::execution::instance::InstanceId;
use crate::flog_trace;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Outcome of one dispatch, sent back to the coordinator.
#[derive(Debug, Clone)]
pub struct WorkerReport {
    pub instance: InstanceId,
    pub outcome: TaskOutcome,
}

#[derive(Debug)]
struct Worker {
    cancel: CancellationToken,
    started_at: Instant,
}

pub struct WorkerPool {
    executor: Arc<dyn TaskExecutor>,
    workers: HashMap<InstanceId, Worker>,
    max_concurrent: usize,
    report_tx: mpsc::Sender<WorkerReport>,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// Create a pool running at most `max_concurrent` workers (at least one).
    ///
    /// Canceling `cancel` cancels every worker.
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        max_concurrent: usize,
        report_tx: mpsc::Sender<WorkerReport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            executor,
            workers: HashMap::new(),
            max_concurrent: max_concurrent.max(1),
            report_tx,
            cancel,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn has_capacity(&self) -> bool {
        self.workers.len() < self.max_concurrent
    }

    /// Free worker slots.
    pub fn available(&self) -> usize {
        self.max_concurrent.saturating_sub(self.workers.len())
    }

    /// Start a worker for `assignment`.
    ///
    /// # Errors
    ///
    /// Returns `WorkerPoolFull` if the pool is at capacity.
    pub fn spawn(&mut self, assignment: Assignment) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::WorkerPoolFull {
                max: self.max_concurrent,
            });
        }

        let instance = assignment.instance;
        let cancel = self.cancel.child_token();
        let work = self.executor.execute(assignment, cancel.clone());
        let report_tx = self.report_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => TaskOutcome::Canceled,
                outcome = work => outcome,
            };
            // The coordinator may already be gone.
            let _ = report_tx.send(WorkerReport { instance, outcome }).await;
        });

        flog_trace!("worker started for {}", instance);
        self.workers.insert(
            instance,
            Worker {
                cancel,
                started_at: Instant::now(),
            },
        );
        Ok(())
    }

    /// Forget the worker of `instance` once its report arrived.
    pub fn finish(&mut self, instance: &InstanceId) -> bool {
        match self.workers.remove(instance) {
            Some(worker) => {
                flog_trace!(
                    "worker for {} done after {:?}",
                    instance,
                    worker.started_at.elapsed()
                );
                true
            }
            None => false,
        }
    }

    /// Cancel one worker. It still reports, with `Canceled`.
    pub fn cancel(&self, instance: &InstanceId) -> bool {
        match self.workers.get(instance) {
            Some(worker) => {
                worker.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        for worker in self.workers.values() {
            worker.cancel.cancel();
        }
    }

    pub fn active_count(&self) -> usize {
        self.workers.len()
    }

    pub fn is_active(&self, instance: &InstanceId) -> bool {
        self.workers.contains_key(instance)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
