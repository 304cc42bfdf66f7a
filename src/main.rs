use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use flowsched::core::{FlowPlan, FlowScript, Job, JobDescriptor, JobStatus, TaskGraph, TaskId};
use flowsched::execution::{InstanceStatus, JobReport, LocalExecutor, Scheduler};
use flowsched::{flog, flog_debug, Config, Result};

/// flowsched - run task graphs with branch, loop and replicate control flow
#[derive(Parser, Debug)]
#[command(name = "flowsched")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    FLOWSCHED_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.flowsched/flowsched.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.flowsched/flowsched.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Run a job with the local rhai executor
    Run {
        /// Job descriptor (.toml or .json)
        job_file: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Override the instance limit
        #[arg(long)]
        max_instances: Option<usize>,

        /// Override the number of concurrent workers
        #[arg(long)]
        workers: Option<usize>,
    },

    /// Check a job descriptor without running it
    Validate {
        /// Job descriptor (.toml or .json)
        job_file: PathBuf,
    },

    /// Show the task order and resolved flow blocks of a job
    Plan {
        /// Job descriptor (.toml or .json)
        job_file: PathBuf,
    },
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    flowsched::log::init(cli.debug);

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    match cli.command {
        Command::Run {
            job_file,
            json,
            max_instances,
            workers,
        } => {
            if let Some(max) = max_instances {
                config.max_instances = max;
            }
            if let Some(workers) = workers {
                config.max_workers = workers;
            }
            run_job(&job_file, &config, json)
        }
        Command::Validate { job_file } => {
            let job = load_job(&job_file)?;
            let plan = job.validate()?;
            println!(
                "{}: ok ({} tasks, {} branches, {} loops, {} replicates)",
                job.name,
                job.graph.task_count(),
                plan.branch_count(),
                plan.loop_count(),
                plan.replicate_count()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Plan { job_file } => {
            let job = load_job(&job_file)?;
            let plan = job.validate()?;
            print_plan(&job, &plan)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn load_job(path: &Path) -> Result<Job> {
    flog_debug!("loading job from {}", path.display());
    JobDescriptor::load(path)?.into_job(path.parent())
}

fn run_job(path: &Path, config: &Config, json: bool) -> Result<ExitCode> {
    let job = load_job(path)?;
    flog!("run {} (max_instances={}, workers={})", job.name, config.max_instances, config.max_workers);

    let scheduler = Scheduler::new(job, config, Arc::new(LocalExecutor::default()))?;
    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(scheduler.run())?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    Ok(if report.status == JobStatus::Finished {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_report(report: &JobReport) {
    println!("Job:     {} ({})", report.job_name, report.job_id);
    println!("Status:  {}", report.status);
    if let Some(error) = &report.error {
        println!("Error:   {}", error);
    }
    println!();

    let width = report
        .instances
        .iter()
        .map(|i| i.label.len())
        .max()
        .unwrap_or(0);
    for instance in &report.instances {
        if instance.task.is_none() {
            continue;
        }
        let marker = match instance.status {
            InstanceStatus::Finished => "✓",
            InstanceStatus::Failed => "✗",
            InstanceStatus::Skipped | InstanceStatus::Canceled => "-",
            _ => "·",
        };
        print!("  {} {:<width$}  {}", marker, instance.label, instance.status, width = width);
        if let Some(error) = &instance.error {
            print!("  {}", error);
        }
        println!();
    }

    if !report.output.is_empty() {
        println!();
        println!("Output:");
        for (label, lines) in &report.output {
            for line in lines {
                println!("  [{}] {}", label, line);
            }
        }
    }

    if !report.result_map.is_empty() {
        println!();
        println!("Results:");
        for (key, value) in &report.result_map {
            println!("  {} = {}", key, value);
        }
    }

    if !report.signals.is_empty() || !report.awaited_signals.is_empty() {
        println!();
        println!("Signals:");
        for signal in &report.signals {
            println!("  sent     {}", signal);
        }
        for signal in &report.awaited_signals {
            println!("  awaited  {}", signal);
        }
    }
}

fn print_plan(job: &Job, plan: &FlowPlan) -> Result<()> {
    let graph = &job.graph;
    println!("{}", job.name);
    for (n, task) in graph.topological_order()?.into_iter().enumerate() {
        let deps: Vec<&str> = graph
            .dependencies(&task.id)
            .iter()
            .map(|d| graph.name_of(d))
            .collect();
        print!("  {:>2}. {}", n + 1, task.name);
        if task.is_start() || task.is_end() {
            print!(" [{}]", task.flow_block);
        }
        if !deps.is_empty() {
            print!("  <- {}", deps.join(", "));
        }
        println!();

        match &task.flow_script {
            Some(FlowScript::Branch {
                if_target,
                else_target,
                continuation,
                ..
            }) => {
                println!(
                    "        branch: if -> {}, else -> {}, then {}",
                    if_target, else_target, continuation
                );
            }
            Some(FlowScript::Loop { target, .. }) => {
                if let Some(looping) = plan.looping(&task.id) {
                    println!(
                        "        loop -> {} (body: {})",
                        target,
                        names(graph, &looping.body)
                    );
                }
            }
            Some(FlowScript::Replicate { .. }) => {
                if let Some(replicate) = plan.replicate(&task.id) {
                    println!(
                        "        replicate: {} merged at {}",
                        names(graph, &replicate.region),
                        graph.name_of(&replicate.merge)
                    );
                }
            }
            None => {}
        }
    }
    Ok(())
}

fn names(graph: &TaskGraph, ids: &BTreeSet<TaskId>) -> String {
    ids.iter()
        .map(|id| graph.name_of(id))
        .collect::<Vec<_>>()
        .join(", ")
}
