//! The live execution graph.
//!
//! A grow-only arena of task instances on a petgraph `DiGraph`. Edges run
//! from the instance that satisfied a dependency to the instance it
//! satisfied, so the graph stays acyclic: loops add fresh instances in a new
//! frame instead of revisiting old ones.
//!
//! Frames scope instance lookup. The root frame holds first-iteration
//! instances; every loop iteration and every replica gets its own frame with
//! the set of tasks it re-instantiates.

use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::execution::instance::{
    FrameId, InstanceId, InstanceKind, InstanceStatus, TaskInstance,
};
use crate::flog_trace;
use petgraph::algo::is_cyclic_directed;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameScope {
    Root,
    /// One loop iteration after the first.
    Iteration { holder: TaskId },
    /// One replica of a replicated region.
    Replica { split: TaskId, join: InstanceId },
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub id: FrameId,
    pub parent: Option<FrameId>,
    pub iteration: u32,
    pub replica: Option<u32>,
    /// Tasks instantiated in this frame; `None` means all of them.
    pub region: Option<BTreeSet<TaskId>>,
    pub scope: FrameScope,
}

impl Frame {
    pub fn contains(&self, task: &TaskId) -> bool {
        self.region.as_ref().map_or(true, |r| r.contains(task))
    }
}

/// Where a delivery to a task lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The task's instance in this frame.
    Frame(FrameId),
    /// Leaving a replica: the replica group's join point.
    Join(InstanceId),
}

pub struct ExecutionGraph {
    graph: DiGraph<TaskInstance, ()>,
    frames: Vec<Frame>,
    by_frame: HashMap<(FrameId, TaskId), InstanceId>,
    /// Continuations waiting on a branch arm's terminal task.
    routes: HashMap<(FrameId, TaskId), Vec<TaskId>>,
    max_instances: usize,
}

impl ExecutionGraph {
    pub fn new(max_instances: usize) -> Self {
        let root = Frame {
            id: FrameId(0),
            parent: None,
            iteration: 0,
            replica: None,
            region: None,
            scope: FrameScope::Root,
        };
        Self {
            graph: DiGraph::new(),
            frames: vec![root],
            by_frame: HashMap::new(),
            routes: HashMap::new(),
            max_instances,
        }
    }

    pub fn root_frame(&self) -> FrameId {
        FrameId(0)
    }

    pub fn max_instances(&self) -> usize {
        self.max_instances
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn frame(&self, id: FrameId) -> Result<&Frame> {
        self.frames
            .get(id.0)
            .ok_or_else(|| Error::Validation(format!("unknown frame {}", id.0)))
    }

    pub fn push_frame(
        &mut self,
        parent: FrameId,
        iteration: u32,
        replica: Option<u32>,
        region: BTreeSet<TaskId>,
        scope: FrameScope,
    ) -> FrameId {
        let id = FrameId(self.frames.len());
        self.frames.push(Frame {
            id,
            parent: Some(parent),
            iteration,
            replica,
            region: Some(region),
            scope,
        });
        id
    }

    fn check_capacity(&self) -> Result<()> {
        if self.graph.node_count() >= self.max_instances {
            return Err(Error::GraphExpansionLimitExceeded {
                limit: self.max_instances,
            });
        }
        Ok(())
    }

    /// Whether `additional` more instances fit under the limit.
    pub fn has_room_for(&self, additional: usize) -> bool {
        self.graph.node_count().saturating_add(additional) <= self.max_instances
    }

    /// Create the instance of `task` in `frame`.
    ///
    /// # Errors
    /// Returns `GraphExpansionLimitExceeded` when the graph is full.
    pub fn create_task_instance(
        &mut self,
        task: &Task,
        frame: FrameId,
        expected: usize,
    ) -> Result<InstanceId> {
        self.check_capacity()?;
        let (iteration, replica) = {
            let f = self.frame(frame)?;
            (f.iteration, f.replica)
        };
        let id = InstanceId(self.graph.node_count());
        let instance = TaskInstance::new(
            id,
            InstanceKind::Task {
                task: task.id,
                name: task.name.clone(),
            },
            frame,
            iteration,
            replica,
            expected,
        );
        flog_trace!("instance {} {} created (expects {})", id, instance.label(), expected);
        self.graph.add_node(instance);
        self.by_frame.insert((frame, task.id), id);
        Ok(id)
    }

    /// Create a join point in `frame` waiting for `expected` arrivals.
    pub fn create_join(
        &mut self,
        frame: FrameId,
        split: TaskId,
        merge: &Task,
        expected: usize,
    ) -> Result<InstanceId> {
        self.check_capacity()?;
        let (iteration, replica) = {
            let f = self.frame(frame)?;
            (f.iteration, f.replica)
        };
        let id = InstanceId(self.graph.node_count());
        let instance = TaskInstance::new(
            id,
            InstanceKind::Join {
                split,
                merge: merge.id,
                merge_name: merge.name.clone(),
            },
            frame,
            iteration,
            replica,
            expected,
        );
        self.graph.add_node(instance);
        Ok(id)
    }

    pub fn lookup(&self, frame: FrameId, task: &TaskId) -> Option<InstanceId> {
        self.by_frame.get(&(frame, *task)).copied()
    }

    pub fn connect(&mut self, from: InstanceId, to: InstanceId) {
        let (from, to) = (NodeIndex::new(from.0), NodeIndex::new(to.0));
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, ());
        }
    }

    pub fn get(&self, id: InstanceId) -> Option<&TaskInstance> {
        self.graph.node_weight(NodeIndex::new(id.0))
    }

    pub fn get_mut(&mut self, id: InstanceId) -> Option<&mut TaskInstance> {
        self.graph.node_weight_mut(NodeIndex::new(id.0))
    }

    pub fn instance(&self, id: InstanceId) -> Result<&TaskInstance> {
        self.get(id).ok_or(Error::UnknownInstance(id.0))
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Result<&mut TaskInstance> {
        self.get_mut(id).ok_or(Error::UnknownInstance(id.0))
    }

    /// All instances in creation order.
    pub fn instances(&self) -> impl Iterator<Item = &TaskInstance> {
        self.graph.node_weights()
    }

    pub fn instances_of(&self, task: &TaskId) -> Vec<&TaskInstance> {
        self.instances()
            .filter(|i| i.task_id().as_ref() == Some(task))
            .collect()
    }

    pub fn count(&self, status: InstanceStatus) -> usize {
        self.instances().filter(|i| i.status == status).count()
    }

    /// Instances this one depends on, in creation order.
    pub fn dependencies(&self, id: InstanceId) -> Vec<InstanceId> {
        self.neighbors(id, Direction::Incoming)
    }

    pub fn dependents(&self, id: InstanceId) -> Vec<InstanceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: InstanceId, direction: Direction) -> Vec<InstanceId> {
        let mut ids: Vec<InstanceId> = self
            .graph
            .neighbors_directed(NodeIndex::new(id.0), direction)
            .map(|n| InstanceId(n.index()))
            .collect();
        ids.sort();
        ids
    }

    /// Instances whose results `id` receives: its direct dependencies, with
    /// join points replaced by their replicas in replica order.
    pub fn result_sources(&self, id: InstanceId) -> Vec<InstanceId> {
        let mut sources = Vec::new();
        for dep in self.dependencies(id) {
            match self.get(dep) {
                Some(instance) if instance.is_join() => {
                    let mut replicas = self.dependencies(dep);
                    replicas.sort_by_key(|r| {
                        (self.get(*r).and_then(|i| i.replica).unwrap_or(0), *r)
                    });
                    sources.extend(replicas);
                }
                Some(_) => sources.push(dep),
                None => {}
            }
        }
        sources
    }

    /// Find where a delivery from `frame` to `task` lands.
    pub fn place(&self, frame: FrameId, task: &TaskId) -> Result<Placement> {
        let mut current = frame;
        loop {
            let f = self.frame(current)?;
            if f.contains(task) {
                return Ok(Placement::Frame(current));
            }
            match (f.scope, f.parent) {
                (FrameScope::Replica { join, .. }, _) => return Ok(Placement::Join(join)),
                (_, Some(parent)) => current = parent,
                (_, None) => return Ok(Placement::Frame(current)),
            }
        }
    }

    pub fn add_route(&mut self, frame: FrameId, terminal: TaskId, continuation: TaskId) {
        self.routes
            .entry((frame, terminal))
            .or_default()
            .push(continuation);
    }

    /// Continuations registered for `task` in `frame`. Iteration frames fall
    /// back to their parent, so an arm that loops still reaches its
    /// continuation.
    pub fn routes(&self, frame: FrameId, task: &TaskId) -> Vec<TaskId> {
        let mut current = Some(frame);
        while let Some(id) = current {
            if let Some(targets) = self.routes.get(&(id, *task)) {
                return targets.clone();
            }
            current = match self.frames.get(id.0) {
                Some(f) if matches!(f.scope, FrameScope::Iteration { .. }) => f.parent,
                _ => None,
            };
        }
        Vec::new()
    }

    /// Every instance living in the replicas collected by `join`, nested
    /// frames included.
    pub fn replica_instances(&self, join: InstanceId) -> Vec<InstanceId> {
        let mut frames: BTreeSet<FrameId> = self
            .frames
            .iter()
            .filter(|f| matches!(f.scope, FrameScope::Replica { join: j, .. } if j == join))
            .map(|f| f.id)
            .collect();
        // Frames are created after their parents, so one pass suffices.
        for f in &self.frames {
            if f.parent.is_some_and(|p| frames.contains(&p)) {
                frames.insert(f.id);
            }
        }
        self.instances()
            .filter(|i| frames.contains(&i.frame))
            .map(|i| i.id)
            .collect()
    }

    pub fn is_acyclic(&self) -> bool {
        !is_cyclic_directed(&self.graph)
    }
}

impl std::fmt::Debug for ExecutionGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionGraph")
            .field("instances", &self.len())
            .field("frames", &self.frames.len())
            .field("max_instances", &self.max_instances)
            .finish()
    }
}
