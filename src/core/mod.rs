//! Static job model.
//!
//! Tasks, the static task graph, flow block resolution, jobs and the
//! descriptor format they are submitted in.

pub mod blocks;
pub mod descriptor;
pub mod graph;
pub mod job;
pub mod task;

pub use blocks::{BranchArm, BranchPlan, FlowPlan, LoopPlan, ReplicatePlan};
pub use descriptor::{JobDescriptor, TaskDescriptor};
pub use graph::TaskGraph;
pub use job::{Job, JobId, JobState, JobStatus};
pub use task::{ErrorPolicy, FlowBlock, FlowKind, FlowScript, Task, TaskId};
