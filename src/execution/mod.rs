//! Job execution: the live instance graph, its expansion, and the async
//! machinery that dispatches instances to executors.

pub mod executor;
pub mod expander;
pub mod graph;
pub mod instance;
pub mod local;
pub mod pool;
pub mod run;
pub mod scheduler;

pub use executor::{Assignment, FnExecutor, TaskExecutor, TaskOutcome, TaskOutput};
pub use expander::{Delivery, Expander};
pub use graph::{ExecutionGraph, Frame, FrameScope, Placement};
pub use instance::{FailureKind, FrameId, InstanceId, InstanceKind, InstanceStatus, TaskError, TaskInstance};
pub use local::LocalExecutor;
pub use pool::{WorkerPool, WorkerReport};
pub use run::{InstanceSummary, JobReport, JobRun};
pub use scheduler::{JobHandle, Scheduler, SchedulerEvent};
