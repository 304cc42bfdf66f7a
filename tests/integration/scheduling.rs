//! Scheduler integration tests.
//!
//! These tests run jobs on the async scheduler with mock executors and
//! verify readiness, concurrency limits, cancellation and status queries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::json;
use tokio::sync::mpsc;

use flowsched::core::JobStatus;
use flowsched::execution::{
    Assignment, FnExecutor, InstanceStatus, Scheduler, SchedulerEvent, TaskExecutor, TaskOutcome,
};
use flowsched::Config;

use crate::fixtures::{
    diamond_job, echo_executor, loop_job, run_with, three_controls_job, DelayedExecutor, Driver,
};

/// Test: DAG readiness
/// Given a diamond a -> {b, c} -> d
/// When instances complete round by round
/// Then each task becomes ready only after all its dependencies finished
#[test]
fn test_dag_readiness_rounds() {
    let mut driver = Driver::new(diamond_job());
    driver.start();
    let finish = |a: &Assignment| TaskOutcome::finished(json!(a.task_name));

    assert_eq!(driver.round(&finish), vec!["a"]);
    let mut second = driver.round(&finish);
    second.sort();
    assert_eq!(second, vec!["b", "c"]);
    assert_eq!(driver.round(&finish), vec!["d"]);
    assert!(!driver.run.has_ready());
    assert_eq!(driver.run.status(), JobStatus::Finished);
}

#[test]
fn test_join_waits_for_every_dependency() {
    let mut driver = Driver::new(diamond_job());
    driver.start();

    let a = driver.run.take_ready(10).unwrap().remove(0);
    driver
        .run
        .on_report(a.instance, TaskOutcome::finished(json!("a")))
        .unwrap();
    let mut middle = driver.run.take_ready(10).unwrap();
    assert_eq!(middle.len(), 2);

    let b = middle.remove(0);
    driver
        .run
        .on_report(b.instance, TaskOutcome::finished(json!(1)))
        .unwrap();
    assert!(driver.run.take_ready(10).unwrap().is_empty());

    let c = middle.remove(0);
    driver
        .run
        .on_report(c.instance, TaskOutcome::finished(json!(2)))
        .unwrap();
    let d = driver.run.take_ready(10).unwrap();
    assert_eq!(d.len(), 1);
    assert_eq!(d[0].task_name, "d");
    assert_eq!(d[0].results.len(), 2);
}

/// Test: Status queries
/// Given a finished job
/// When its report is taken repeatedly
/// Then every snapshot is identical
#[test]
fn test_status_queries_are_idempotent() {
    let mut driver = Driver::new(three_controls_job("if", 2, "loop_ = false;"));
    driver.finish_all();

    let first = driver.run.report();
    let second = driver.run.report();
    assert_eq!(first, second);
    assert_eq!(driver.run.status(), driver.run.status());
    assert!(driver.run.is_terminal());
}

#[tokio::test]
async fn test_scheduler_runs_diamond() {
    let report = run_with(diamond_job(), echo_executor()).await;
    assert_eq!(report.status, JobStatus::Finished);
    assert_eq!(report.instances.len(), 4);
}

/// Test: Concurrency limit
/// Given a wide job and max_workers = 2
/// When it runs
/// Then at most two instances execute at a time
#[tokio::test]
async fn test_max_workers_is_respected() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (r, p) = (Arc::clone(&running), Arc::clone(&peak));
    let executor: Arc<dyn TaskExecutor> = Arc::new(FnExecutor::new(move |_a: Assignment, _cancel| {
        let (running, peak) = (Arc::clone(&r), Arc::clone(&p));
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            TaskOutcome::finished(json!(null))
        }
        .boxed()
    }));

    let mut job = flowsched::Job::new("wide");
    for n in 0..8 {
        job.add_task(flowsched::Task::new(&format!("t{}", n), ""))
            .unwrap();
    }
    let config = Config {
        max_workers: 2,
        ..Config::default()
    };
    let report = Scheduler::new(job, &config, executor)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, JobStatus::Finished);
    assert!(peak.load(Ordering::SeqCst) <= 2);
}

/// Test: Stress with random completion order
/// Given the three-controls job and randomly delayed tasks
/// When it runs repeatedly with few workers
/// Then every run materializes exactly the expected instances
#[tokio::test]
async fn test_random_completion_stress() {
    for _ in 0..5 {
        let executor = Arc::new(DelayedExecutor::new(3));
        let dispatched = Arc::clone(&executor.dispatched);
        let config = Config {
            max_workers: 3,
            ..Config::default()
        };
        let report = Scheduler::new(three_controls_job("if", 4, "loop_ = iteration < 2;"), &config, executor)
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, JobStatus::Finished);
        assert_eq!(report.count("process", InstanceStatus::Finished), 12);
        assert_eq!(report.count("merge", InstanceStatus::Finished), 3);
        assert_eq!(report.count("end", InstanceStatus::Finished), 3);
        assert!(report.instances_of("task_else").is_empty());
        // 3 iterations x (start, condition, task_if, continuation, split, merge, end) + 12 replicas
        assert_eq!(dispatched.load(Ordering::SeqCst), 3 * 7 + 12);
    }
}

#[tokio::test]
async fn test_events_report_every_instance() {
    let (tx, mut rx) = mpsc::channel(1000);
    let report = Scheduler::new(loop_job("loop_ = iteration < 1;"), &Config::default(), echo_executor())
        .unwrap()
        .with_events(tx)
        .run()
        .await
        .unwrap();

    let mut started = Vec::new();
    let mut reported = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            SchedulerEvent::InstanceStarted { label, .. } => started.push(label),
            SchedulerEvent::InstanceReported { status, .. } => {
                assert_eq!(status, InstanceStatus::Finished);
                reported += 1;
            }
            _ => {}
        }
    }
    assert_eq!(started, vec!["start", "end", "start#1", "end#1"]);
    assert_eq!(reported, 4);
    assert_eq!(report.status, JobStatus::Finished);
}

/// Test: Cancel an endless loop
/// Given a loop that never exits
/// When the job is canceled while it runs
/// Then no further iterations start and nothing is left running
#[tokio::test]
async fn test_cancel_stops_loop_iterations() {
    let executor = Arc::new(DelayedExecutor::new(2));
    let dispatched = Arc::clone(&executor.dispatched);
    let mut handle = Scheduler::new(loop_job("loop_ = true;"), &Config::default(), executor)
        .unwrap()
        .spawn();

    handle
        .wait_for(|s| *s == JobStatus::Running)
        .await
        .unwrap();
    while dispatched.load(Ordering::SeqCst) < 6 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    handle.cancel();
    let report = handle.wait().await.unwrap();
    let after_cancel = dispatched.load(Ordering::SeqCst);

    assert_eq!(report.status, JobStatus::Canceled);
    assert!(report.instances.iter().all(|i| i.status.is_terminal()));
    assert!(report.instances.len() <= after_cancel + 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(dispatched.load(Ordering::SeqCst), after_cancel);
}

#[tokio::test]
async fn test_handle_status_while_running() {
    let executor: Arc<dyn TaskExecutor> = Arc::new(FnExecutor::new(|_a: Assignment, cancel| {
        async move {
            cancel.cancelled().await;
            TaskOutcome::Canceled
        }
        .boxed()
    }));
    let mut handle = Scheduler::new(diamond_job(), &Config::default(), executor)
        .unwrap()
        .spawn();

    let status = handle
        .wait_for(|s| *s == JobStatus::Running)
        .await
        .unwrap();
    assert_eq!(status, JobStatus::Running);
    assert_eq!(handle.status(), handle.status());

    handle.cancel();
    let report = handle.wait().await.unwrap();
    assert_eq!(report.status, JobStatus::Canceled);
    assert_eq!(report.count("a", InstanceStatus::Canceled), 1);
}
