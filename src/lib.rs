pub mod config;
pub mod core;
pub mod error;
pub mod execution;
pub mod flow;
pub mod log;
pub mod store;
pub mod util;

pub use config::Config;
pub use crate::core::{ErrorPolicy, FlowBlock, FlowScript, Job, JobDescriptor, JobStatus, Task};
pub use error::{Error, Result};
pub use execution::{
    FnExecutor, JobHandle, JobReport, LocalExecutor, Scheduler, TaskExecutor, TaskOutcome,
    TaskOutput,
};
