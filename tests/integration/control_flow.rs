//! Branch, loop and replicate semantics.
//!
//! These tests drive a `JobRun` directly, completing ready instances in
//! shuffled order, and check which instances the engine materializes.

use serde_json::json;

use flowsched::core::{FlowBlock, FlowScript, JobStatus};
use flowsched::execution::{FailureKind, InstanceStatus, TaskOutcome};

use crate::fixtures::{
    branch_job, job_with, loop_job, replicate_job, task, three_controls_job, Driver,
};

/// Test: Branch IF
/// Given a branch script choosing "if"
/// When the job runs
/// Then the ELSE target is never created and the continuation runs once
#[test]
fn test_branch_if_never_creates_else() {
    let report = Driver::new(branch_job(r#"branch = "if";"#)).finish_all();

    assert_eq!(report.status, JobStatus::Finished);
    assert_eq!(report.count("task_if", InstanceStatus::Finished), 1);
    assert!(report.instances_of("task_else").is_empty());
    assert_eq!(report.count("task_continuation", InstanceStatus::Finished), 1);
}

#[test]
fn test_branch_else_from_job_variable() {
    let job = branch_job(r#"branch = if variables["MODE"] == "fast" { "else" } else { "if" };"#)
        .with_variable("MODE", "fast");
    let report = Driver::new(job).finish_all();

    assert_eq!(report.status, JobStatus::Finished);
    assert!(report.instances_of("task_if").is_empty());
    assert_eq!(report.count("task_else", InstanceStatus::Finished), 1);
    assert_eq!(report.count("task_continuation", InstanceStatus::Finished), 1);
}

#[test]
fn test_branch_without_binding_fails_holder() {
    let mut driver = Driver::new(branch_job(r#""if""#));
    let report = driver.finish_all();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.count("condition", InstanceStatus::Failed), 1);
    assert!(report.instances_of("task_if").is_empty());
    assert!(report.instances_of("task_else").is_empty());

    let condition = driver.run.instances_named("condition");
    let error = condition[0].error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::FlowScript);
    assert!(error.message.contains("`branch`"));
}

#[test]
fn test_branch_on_task_result() {
    let mut driver = Driver::new(branch_job(
        r#"branch = if result > 10 { "if" } else { "else" };"#,
    ));
    let report = driver.run_to_end(|a| {
        if a.task_name == "condition" {
            TaskOutcome::finished(json!(3))
        } else {
            TaskOutcome::finished(json!(null))
        }
    });
    assert_eq!(report.count("task_else", InstanceStatus::Finished), 1);
    assert!(report.instances_of("task_if").is_empty());
}

/// Test: Branch script error
/// Given a branch script producing neither "if" nor "else"
/// When the holder finishes
/// Then it fails with a flow script error and no arm runs
#[test]
fn test_branch_invalid_choice_fails_holder() {
    let mut driver = Driver::new(branch_job(r#"branch = "maybe";"#));
    let report = driver.finish_all();

    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.count("condition", InstanceStatus::Failed), 1);
    assert!(report.instances_of("task_if").is_empty());
    assert!(report.instances_of("task_else").is_empty());

    let condition = driver.run.instances_named("condition");
    let error = condition[0].error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::FlowScript);
    assert!(error.message.contains("maybe"));
}

/// `cond` picks between the block `if_start -> if_work -> if_end` and
/// `task_else`, then `after`. `if_end` loops back to `if_start` when given
/// a loop script.
fn branch_into_block(branch: &str, loop_script: Option<&str>) -> flowsched::Job {
    let mut if_end = task("if_end").with_flow_block(FlowBlock::End);
    if let Some(script) = loop_script {
        if_end = if_end.with_flow_script(FlowScript::looping(script, "if_start"));
    }
    job_with(
        "branch_into_block",
        vec![
            task("cond").with_flow_script(FlowScript::branch(
                &format!("branch = \"{}\";", branch),
                "if_start",
                "task_else",
                "after",
            )),
            task("if_start").with_flow_block(FlowBlock::Start),
            task("if_work"),
            if_end,
            task("task_else"),
            task("after"),
        ],
        &[("if_work", "if_start"), ("if_end", "if_work")],
    )
}

/// Test: Branch arm spanning a block
/// Given an IF arm that is a start..end block
/// When the branch chooses it
/// Then the whole block runs once before the continuation
#[test]
fn test_branch_arm_block_runs_before_continuation() {
    let mut driver = Driver::new(branch_into_block("if", None));
    driver.start();
    let finish = |a: &flowsched::execution::Assignment| TaskOutcome::finished(json!(a.task_name));

    let mut order = Vec::new();
    while driver.run.has_ready() {
        order.extend(driver.round(&finish));
    }
    assert_eq!(order, vec!["cond", "if_start", "if_work", "if_end", "after"]);

    let report = driver.run.report();
    assert_eq!(report.status, JobStatus::Finished);
    assert!(report.instances_of("task_else").is_empty());
}

#[test]
fn test_branch_else_skips_block() {
    let report = Driver::new(branch_into_block("else", Some("loop_ = true;"))).finish_all();

    assert_eq!(report.status, JobStatus::Finished);
    assert!(report.instances_of("if_start").is_empty());
    assert!(report.instances_of("if_end").is_empty());
    assert_eq!(report.count("after", InstanceStatus::Finished), 1);
}

/// Test: Branch into a loop
/// Given an IF arm that is a start..end loop running two iterations
/// When the branch chooses it
/// Then the loop target is re-entered and the continuation runs once after
/// the last iteration
#[test]
fn test_branch_into_loop_block() {
    for seed in 0..5 {
        let report = Driver::new(branch_into_block("if", Some("loop_ = iteration < 1;")))
            .seeded(seed)
            .finish_all();

        assert_eq!(report.status, JobStatus::Finished, "{:?}", report.error);
        let starts: Vec<&str> = report
            .instances_of("if_start")
            .iter()
            .map(|i| i.label.as_str())
            .collect();
        assert_eq!(starts, vec!["if_start", "if_start#1"]);
        assert_eq!(report.count("if_work", InstanceStatus::Finished), 2);
        assert_eq!(report.count("if_end", InstanceStatus::Finished), 2);
        assert_eq!(report.count("after", InstanceStatus::Finished), 1);
        assert!(report.instances_of("task_else").is_empty());
    }
}

#[test]
fn test_branch_into_loop_continuation_waits_for_last_iteration() {
    let mut driver = Driver::new(branch_into_block("if", Some("loop_ = iteration < 2;")));
    driver.start();
    let finish = |a: &flowsched::execution::Assignment| TaskOutcome::finished(json!(a.task_name));

    let mut order = Vec::new();
    while driver.run.has_ready() {
        order.extend(driver.round(&finish));
    }
    let body = ["if_start", "if_work", "if_end"];
    let mut expected = vec!["cond"];
    for _ in 0..3 {
        expected.extend(body);
    }
    expected.push("after");
    assert_eq!(order, expected);
    assert_eq!(driver.run.status(), JobStatus::Finished);
}

/// Test: Loop twice
/// Given a loop script `loop_ = iteration < 1;`
/// When the job runs
/// Then the body runs for iterations 0 and 1
#[test]
fn test_loop_runs_two_iterations() {
    let report = Driver::new(loop_job("loop_ = iteration < 1;")).finish_all();

    assert_eq!(report.status, JobStatus::Finished);
    let starts = report.instances_of("start");
    assert_eq!(starts.len(), 2);
    let iterations: Vec<u32> = starts.iter().map(|i| i.iteration).collect();
    assert_eq!(iterations, vec![0, 1]);
    assert_eq!(report.count("end", InstanceStatus::Finished), 2);
    assert_eq!(starts[1].label, "start#1");
}

#[test]
fn test_loop_false_runs_once() {
    let report = Driver::new(loop_job("loop_ = false;")).finish_all();
    assert_eq!(report.status, JobStatus::Finished);
    assert_eq!(report.instances_of("start").len(), 1);
    assert_eq!(report.instances_of("end").len(), 1);
}

#[test]
fn test_loop_iteration_variable_reaches_tasks() {
    let mut driver = Driver::new(loop_job("loop_ = iteration < 3;"));
    let report = driver.run_to_end(|a| TaskOutcome::finished(json!(a.variables["TASK_ITERATION"])));

    assert_eq!(report.count("end", InstanceStatus::Finished), 4);
    let seen: Vec<u32> = report.instances_of("end").iter().map(|i| i.iteration).collect();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

#[test]
fn test_loop_body_waits_for_previous_iteration() {
    let mut driver = Driver::new(loop_job("loop_ = iteration < 2;"));
    driver.start();
    let finish = |a: &flowsched::execution::Assignment| TaskOutcome::finished(json!(a.task_name));

    // One instance at a time: start, end, start#1, end#1, ...
    let mut order = Vec::new();
    while driver.run.has_ready() {
        let names = driver.round(&finish);
        assert_eq!(names.len(), 1);
        order.extend(names);
    }
    assert_eq!(order, vec!["start", "end", "start", "end", "start", "end"]);
    assert_eq!(driver.run.status(), JobStatus::Finished);
}

/// Test: Replicate three
/// Given `runs = 3`
/// When the job runs
/// Then three replicas run and the merge sees their results in replica order
#[test]
fn test_replicate_three_merges_in_order() {
    let job = job_with(
        "replicate",
        vec![
            task("split")
                .with_flow_block(FlowBlock::Start)
                .with_flow_script(FlowScript::replicate("runs = 3;")),
            task("process"),
            task("merge")
                .with_flow_block(FlowBlock::End)
                .with_precious_result(true),
        ],
        &[("process", "split"), ("merge", "process")],
    );
    let report = Driver::new(job).seeded(11).run_to_end(|a| match a.task_name.as_str() {
        "process" => TaskOutcome::finished(json!(a.replica)),
        "merge" => TaskOutcome::finished(json!(a.results)),
        _ => TaskOutcome::finished(json!(null)),
    });

    assert_eq!(report.status, JobStatus::Finished);
    let replicas: Vec<Option<u32>> = report.instances_of("process").iter().map(|i| i.replica).collect();
    assert_eq!(replicas.len(), 3);
    for r in 0..3 {
        assert!(replicas.contains(&Some(r)));
    }
    assert_eq!(report.count("merge", InstanceStatus::Finished), 1);
    assert_eq!(report.precious_results["merge"], json!([0, 1, 2]));
}

#[test]
fn test_replicate_zero_goes_straight_to_merge() {
    let mut driver = Driver::new(replicate_job("runs = 0;"));
    let report = driver.run_to_end(|a| TaskOutcome::finished(json!(a.results.len())));

    assert_eq!(report.status, JobStatus::Finished);
    assert!(report.instances_of("process").is_empty());
    assert_eq!(report.count("merge", InstanceStatus::Finished), 1);
}

#[test]
fn test_replicate_negative_runs_fails_split() {
    let report = Driver::new(replicate_job("runs = -1;")).finish_all();
    assert_eq!(report.status, JobStatus::Failed);
    assert_eq!(report.count("split", InstanceStatus::Failed), 1);
    assert!(report.instances_of("merge").is_empty());
}

#[test]
fn test_replicate_sees_replication_index() {
    let mut driver = Driver::new(replicate_job("runs = 4;"));
    let report = driver.run_to_end(|a| {
        if a.task_name == "process" {
            assert_eq!(
                a.variables["TASK_REPLICATION"],
                a.replica.unwrap().to_string()
            );
        }
        TaskOutcome::finished(json!(null))
    });
    assert_eq!(report.count("process", InstanceStatus::Finished), 4);
}

/// Test: All three constructs
/// Given a loop around a branch and a replicated block
/// When the job runs for two iterations with three replicas
/// Then every construct expands per iteration
#[test]
fn test_three_controls() {
    let report = Driver::new(three_controls_job("if", 3, "loop_ = iteration < 1;"))
        .seeded(3)
        .finish_all();

    assert_eq!(report.status, JobStatus::Finished);
    for name in ["start", "condition", "task_if", "continuation", "split", "merge", "end"] {
        assert_eq!(report.count(name, InstanceStatus::Finished), 2, "{}", name);
    }
    assert!(report.instances_of("task_else").is_empty());
    assert_eq!(report.count("process", InstanceStatus::Finished), 6);

    let second: Vec<_> = report
        .instances_of("process")
        .into_iter()
        .filter(|i| i.iteration == 1)
        .collect();
    assert_eq!(second.len(), 3);
}

#[test]
fn test_three_controls_else_and_no_replicas() {
    let report = Driver::new(three_controls_job("else", 0, "loop_ = iteration < 2;")).finish_all();

    assert_eq!(report.status, JobStatus::Finished);
    assert_eq!(report.count("task_else", InstanceStatus::Finished), 3);
    assert!(report.instances_of("task_if").is_empty());
    assert!(report.instances_of("process").is_empty());
    assert_eq!(report.count("merge", InstanceStatus::Finished), 3);
    assert_eq!(report.count("end", InstanceStatus::Finished), 3);
}

#[test]
fn test_shuffled_completion_order_is_irrelevant() {
    for seed in 0..20 {
        let report = Driver::new(three_controls_job("if", 2, "loop_ = iteration < 1;"))
            .seeded(seed)
            .finish_all();
        assert_eq!(report.status, JobStatus::Finished, "seed {}", seed);
        assert_eq!(report.count("process", InstanceStatus::Finished), 4, "seed {}", seed);
        assert_eq!(report.count("end", InstanceStatus::Finished), 2, "seed {}", seed);
    }
}
