//! Bundled demo jobs, loaded from their descriptors and run with the
//! local rhai executor.

use std::sync::Arc;

use serde_json::json;

use flowsched::core::{Job, JobDescriptor, JobStatus};
use flowsched::execution::{InstanceStatus, JobReport, LocalExecutor, Scheduler};
use flowsched::Config;

use crate::fixtures::demo_path;

const DEMOS: [&str; 8] = [
    "basic",
    "branch",
    "loop",
    "replicate",
    "three_controls",
    "job_results",
    "variables",
    "signals",
];

fn load(name: &str) -> Job {
    let path = demo_path(name);
    JobDescriptor::load(&path)
        .and_then(|d| d.into_job(path.parent()))
        .unwrap_or_else(|e| panic!("Failed to load {}: {}", name, e))
}

async fn run_demo(name: &str) -> JobReport {
    let report = Scheduler::new(load(name), &Config::default(), Arc::new(LocalExecutor::default()))
        .unwrap()
        .run()
        .await
        .unwrap();
    assert_eq!(
        report.status,
        JobStatus::Finished,
        "{} ended with {:?}",
        name,
        report.error
    );
    report
}

fn lines(report: &JobReport, label: &str) -> Vec<String> {
    report.output.get(label).cloned().unwrap_or_default()
}

#[test]
fn test_every_demo_validates() {
    for name in DEMOS {
        let job = load(name);
        assert!(job.validate().is_ok(), "{} does not validate", name);
    }
}

#[tokio::test]
async fn test_basic_demo() {
    let report = run_demo("basic").await;
    assert_eq!(lines(&report, "hello"), vec!["Hello World from hello"]);
}

#[tokio::test]
async fn test_branch_demo() {
    let report = run_demo("branch").await;
    assert_eq!(lines(&report, "task_if"), vec!["Hello from task_if"]);
    assert!(report.instances_of("task_else").is_empty());
    assert_eq!(report.count("task_continuation", InstanceStatus::Finished), 1);
}

#[tokio::test]
async fn test_loop_demo() {
    let report = run_demo("loop").await;
    assert_eq!(
        lines(&report, "task_start"),
        vec!["Hello from task_start iteration 0"]
    );
    assert_eq!(
        lines(&report, "task_end#1"),
        vec!["Hello from task_end iteration 1"]
    );
    assert_eq!(report.instances_of("task_start").len(), 2);
}

#[tokio::test]
async fn test_replicate_demo() {
    let report = run_demo("replicate").await;
    assert_eq!(report.count("task_process", InstanceStatus::Finished), 3);
    assert_eq!(report.precious_results["task_merge"], json!(30));
    assert_eq!(
        lines(&report, "task_merge"),
        vec!["Hello from task_merge, merging 3 results"]
    );
    // Replica results are released at the merge; their output is not.
    for r in 0..3 {
        assert_eq!(
            lines(&report, &format!("task_process*{}", r)),
            vec![format!("Hello from task_process replica {}", r)]
        );
    }
}

#[tokio::test]
async fn test_three_controls_demo() {
    let report = run_demo("three_controls").await;
    assert_eq!(report.count("task_process", InstanceStatus::Finished), 6);
    assert_eq!(report.count("task_if", InstanceStatus::Finished), 2);
    assert!(report.instances_of("task_else").is_empty());
    assert_eq!(report.count("task_end", InstanceStatus::Finished), 2);
    assert_eq!(lines(&report, "task_start#1"), vec!["Hello from task_start"]);
    assert_eq!(lines(&report, "task_process#1*2"), vec!["Hello from task_process"]);
}

#[tokio::test]
async fn test_job_results_demo() {
    let report = run_demo("job_results").await;
    assert_eq!(report.result_map["T1_NAME"], json!("task1"));
    assert_eq!(report.result_map["T1_RESULT"], json!({"name": "task1", "ok": true}));
    assert_eq!(report.result_map["T2_NAME"], json!("task2"));
    assert_eq!(report.result_map["T2_FROM_T1"], json!("task1"));
    assert_eq!(
        report.precious_results["task2"],
        json!({"name": "task2", "previous": "task1"})
    );
}

#[tokio::test]
async fn test_variables_demo() {
    let report = run_demo("variables").await;
    assert_eq!(report.variables["jobVar"], "updated by task");
    assert!(!report.variables.contains_key("taskVar"));
    assert_eq!(
        lines(&report, "task"),
        vec![
            "pre: jobValue",
            "Job variable: jobValue",
            "Task variable: taskValue",
            "post: updated by task",
        ]
    );
    assert_eq!(
        lines(&report, "reader"),
        vec!["Job variable now: updated by task", "taskVar visible: no"]
    );
}

#[tokio::test]
async fn test_signals_demo() {
    let report = run_demo("signals").await;
    assert_eq!(
        lines(&report, "receiver"),
        vec!["Received signal: Continue"]
    );
    assert!(report.signals.is_empty());
    assert_eq!(report.awaited_signals, vec!["Stop"]);
}
