//! Dynamic graph expansion.
//!
//! Instances are materialised lazily: an instance is created the first time
//! one of its predecessors delivers to it, and becomes ready once every
//! expected delivery has arrived. Flow decisions add instances on top of
//! that:
//!
//! - branch: the chosen arm's entry, plus a route from the arm's terminal
//!   task to the continuation
//! - replicate: a join point and one frame per replica
//! - loop: a new iteration frame seeded with the loop target
//!
//! A failed or skipped instance delivers a skip instead; an instance that
//! receives any skip is skipped itself once its gate opens.

use crate::core::blocks::FlowPlan;
use crate::core::graph::TaskGraph;
use crate::core::task::{FlowKind, TaskId};
use crate::error::{Error, Result};
use crate::execution::graph::{ExecutionGraph, FrameScope, Placement};
use crate::execution::instance::{FrameId, InstanceId, InstanceKind, InstanceStatus};
use crate::flow::{BranchChoice, FlowDecision};
use crate::{flog_debug, flog_trace, flog_warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Done,
    Skipped,
}

pub struct Expander<'a> {
    tasks: &'a TaskGraph,
    plan: &'a FlowPlan,
    graph: &'a mut ExecutionGraph,
    ready: Vec<InstanceId>,
}

impl<'a> Expander<'a> {
    pub fn new(tasks: &'a TaskGraph, plan: &'a FlowPlan, graph: &'a mut ExecutionGraph) -> Self {
        Self {
            tasks,
            plan,
            graph,
            ready: Vec::new(),
        }
    }

    /// Instances that became ready, in the order they opened.
    pub fn into_ready(self) -> Vec<InstanceId> {
        self.ready
    }

    /// Create the root instances of a job.
    pub fn seed(&mut self) -> Result<()> {
        let root = self.graph.root_frame();
        let plan = self.plan;
        for task in plan.roots() {
            let id = self.instantiate(*task, root)?;
            self.open_if_ready(id)?;
        }
        Ok(())
    }

    /// Propagate a finished instance, applying its flow decision if any.
    pub fn on_finished(&mut self, id: InstanceId, decision: Option<FlowDecision>) -> Result<()> {
        match decision {
            None | Some(FlowDecision::Loop(false)) => self.propagate(id, Delivery::Done),
            Some(FlowDecision::Loop(true)) => self.expand_loop(id),
            Some(FlowDecision::Branch(choice)) => self.expand_branch(id, choice),
            Some(FlowDecision::Replicate(runs)) => self.expand_replicate(id, runs),
        }
    }

    /// Propagate a failed instance whose error policy lets the job go on.
    pub fn on_failed(&mut self, id: InstanceId) -> Result<()> {
        self.propagate(id, Delivery::Skipped)
    }

    /// Number of sources that will deliver to `task` in `frame`.
    fn expected(&self, task: &TaskId, frame: FrameId) -> Result<usize> {
        let f = self.graph.frame(frame)?;
        let merged_region = self.plan.replicate_merged_at(task).map(|r| &r.region);
        let dependencies = self.tasks.dependencies(task);

        let mut expected = dependencies
            .iter()
            .filter(|d| f.contains(d) && !merged_region.is_some_and(|r| r.contains(*d)))
            .count();
        if self.plan.is_merge(task) {
            expected += 1;
        }
        // A loop target re-entered by its loop hears only from the loop,
        // even when a branch delivered to it in the first iteration.
        let loop_entry = match f.scope {
            FrameScope::Iteration { holder } => {
                self.plan.looping(&holder).is_some_and(|l| l.target == *task)
            }
            _ => false,
        };
        if self.plan.is_branch_target(task) && !loop_entry {
            expected += 1;
        }
        match f.scope {
            FrameScope::Iteration { .. } => {
                if loop_entry {
                    expected += 1;
                }
            }
            FrameScope::Replica { split, .. } => {
                if dependencies.contains(&split) {
                    expected += 1;
                }
            }
            FrameScope::Root => {}
        }
        Ok(expected)
    }

    /// Get or create the instance of `task` in `frame`.
    fn instantiate(&mut self, task: TaskId, frame: FrameId) -> Result<InstanceId> {
        if let Some(id) = self.graph.lookup(frame, &task) {
            return Ok(id);
        }
        let expected = self.expected(&task, frame)?;
        let template = self
            .tasks
            .get(&task)
            .ok_or_else(|| Error::UnknownTask(task.to_string()))?;
        self.graph.create_task_instance(template, frame, expected)
    }

    fn deliver(
        &mut self,
        from: InstanceId,
        task: TaskId,
        frame: FrameId,
        delivery: Delivery,
    ) -> Result<()> {
        let target = match self.graph.place(frame, &task)? {
            Placement::Frame(frame) => self.instantiate(task, frame)?,
            Placement::Join(join) => join,
        };
        flog_trace!("deliver {} -> {} ({:?})", from, target, delivery);
        self.graph.connect(from, target);
        self.arrive(target, delivery)
    }

    fn arrive(&mut self, id: InstanceId, delivery: Delivery) -> Result<()> {
        let instance = self.graph.instance_mut(id)?;
        if instance.status != InstanceStatus::Pending {
            flog_warn!(
                "late delivery to {} {} in state {}",
                id,
                instance.label(),
                instance.status
            );
            return Ok(());
        }
        instance.gate.arrived += 1;
        if delivery == Delivery::Skipped {
            instance.gate.skipped = true;
        }
        self.open_if_ready(id)
    }

    fn open_if_ready(&mut self, id: InstanceId) -> Result<()> {
        let instance = self.graph.instance_mut(id)?;
        if instance.status != InstanceStatus::Pending || !instance.gate.is_open() {
            return Ok(());
        }

        if instance.is_join() {
            // Replicas count once terminal, whatever their outcome.
            instance.finish(InstanceStatus::Finished);
            let frame = instance.frame;
            let merge = match &instance.kind {
                InstanceKind::Join { merge, .. } => *merge,
                _ => return Ok(()),
            };
            flog_debug!("join {} complete", id);
            return self.deliver(id, merge, frame, Delivery::Done);
        }

        if instance.gate.skipped {
            instance.finish(InstanceStatus::Skipped);
            flog_debug!("instance {} {} skipped", id, instance.label());
            return self.propagate(id, Delivery::Skipped);
        }

        instance.status = InstanceStatus::Ready;
        self.ready.push(id);
        Ok(())
    }

    /// Deliver to static dependents and registered continuations.
    fn propagate(&mut self, id: InstanceId, delivery: Delivery) -> Result<()> {
        let instance = self.graph.instance(id)?;
        let frame = instance.frame;
        let Some(task_id) = instance.task_id() else {
            return Ok(());
        };
        let plan = self.plan;

        let region = plan.replicate(&task_id).map(|r| &r.region);
        let mut targets: Vec<TaskId> = self
            .tasks
            .dependents(&task_id)
            .into_iter()
            .filter(|d| !region.is_some_and(|r| r.contains(d)))
            .collect();
        targets.extend(self.graph.routes(frame, &task_id));

        if delivery == Delivery::Skipped {
            match self.tasks.get(&task_id).and_then(|t| t.flow_kind()) {
                Some(FlowKind::Branch) => {
                    targets.extend(plan.branch(&task_id).map(|b| b.continuation));
                }
                Some(FlowKind::Replicate) => {
                    targets.extend(plan.replicate(&task_id).map(|r| r.merge));
                }
                _ => {}
            }
        }

        for target in targets {
            self.deliver(id, target, frame, delivery)?;
        }
        Ok(())
    }

    fn holder(&self, id: InstanceId) -> Result<(TaskId, FrameId)> {
        let instance = self.graph.instance(id)?;
        let task = instance
            .task_id()
            .ok_or_else(|| Error::Validation(format!("join {} cannot carry a flow script", id)))?;
        Ok((task, instance.frame))
    }

    fn expand_branch(&mut self, id: InstanceId, choice: BranchChoice) -> Result<()> {
        let (task, frame) = self.holder(id)?;
        let plan = self.plan;
        let branch = plan
            .branch(&task)
            .ok_or_else(|| Error::Validation(format!("no branch plan for {}", self.tasks.name_of(&task))))?;
        let arm = match choice {
            BranchChoice::If => &branch.if_arm,
            BranchChoice::Else => &branch.else_arm,
        };

        flog_debug!(
            "branch {} chose {}",
            self.tasks.name_of(&task),
            self.tasks.name_of(&arm.entry)
        );
        self.graph.add_route(frame, arm.terminal, branch.continuation);
        self.deliver(id, arm.entry, frame, Delivery::Done)?;
        self.propagate(id, Delivery::Done)
    }

    fn expand_replicate(&mut self, id: InstanceId, runs: u32) -> Result<()> {
        let (task, frame) = self.holder(id)?;
        let (plan, tasks) = (self.plan, self.tasks);
        let replicate = plan
            .replicate(&task)
            .ok_or_else(|| Error::Validation(format!("no replicate plan for {}", tasks.name_of(&task))))?;
        let merge = tasks
            .get(&replicate.merge)
            .ok_or_else(|| Error::UnknownTask(replicate.merge.to_string()))?;

        let needed = (runs as usize)
            .saturating_mul(replicate.region.len())
            .saturating_add(1);
        if !self.graph.has_room_for(needed) {
            return Err(Error::GraphExpansionLimitExceeded {
                limit: self.graph.max_instances(),
            });
        }

        flog_debug!("replicate {} x{}", self.tasks.name_of(&task), runs);
        let iteration = self.graph.frame(frame)?.iteration;
        let join = self
            .graph
            .create_join(frame, task, merge, runs as usize * replicate.exits)?;
        for r in 0..runs {
            let replica = self.graph.push_frame(
                frame,
                iteration,
                Some(r),
                replicate.region.clone(),
                FrameScope::Replica { split: task, join },
            );
            for entry in &replicate.entries {
                self.deliver(id, *entry, replica, Delivery::Done)?;
            }
        }
        self.open_if_ready(join)?;
        self.propagate(id, Delivery::Done)
    }

    fn expand_loop(&mut self, id: InstanceId) -> Result<()> {
        let (task, frame) = self.holder(id)?;
        let plan = self.plan;
        let looping = plan
            .looping(&task)
            .ok_or_else(|| Error::Validation(format!("no loop plan for {}", self.tasks.name_of(&task))))?;

        let current = self.graph.frame(frame)?;
        let (parent, iteration) = match current.scope {
            FrameScope::Iteration { holder } if holder == task => {
                (current.parent.unwrap_or(frame), current.iteration + 1)
            }
            _ => (frame, 1),
        };
        let replica = current.replica;

        flog_debug!("loop {} -> iteration {}", self.tasks.name_of(&task), iteration);
        let next = self.graph.push_frame(
            parent,
            iteration,
            replica,
            looping.body.clone(),
            FrameScope::Iteration { holder: task },
        );
        self.deliver(id, looping.target, next, Delivery::Done)
    }
}
