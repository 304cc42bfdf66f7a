//! Static task graph for a job.
//!
//! `TaskGraph` holds the user-declared tasks and their static dependencies.
//! Loops are never expressed as static edges; they come from flow scripts,
//! so the static graph must stay acyclic.

use crate::core::blocks::FlowPlan;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::collections::HashMap;

/// The static task dependency graph.
///
/// Nodes are tasks, and an edge `a -> b` means `b` depends on `a`.
pub struct TaskGraph {
    /// The underlying directed graph.
    graph: DiGraph<Task, ()>,
    /// Index mapping from TaskId to NodeIndex for fast lookups.
    task_index: HashMap<TaskId, NodeIndex>,
    /// Index mapping from task name to NodeIndex.
    name_index: HashMap<String, NodeIndex>,
}

impl TaskGraph {
    /// Create a new empty graph.
    pub fn new() -> Self {
        Self {
            graph: DiGraph::new(),
            task_index: HashMap::new(),
            name_index: HashMap::new(),
        }
    }

    /// Add a task to the graph.
    ///
    /// # Errors
    /// Returns `DuplicateTaskName` if a task with the same name exists.
    pub fn add_task(&mut self, task: Task) -> Result<TaskId> {
        if self.name_index.contains_key(&task.name) {
            return Err(Error::DuplicateTaskName(task.name));
        }

        let id = task.id;
        let name = task.name.clone();
        let index = self.graph.add_node(task);
        self.task_index.insert(id, index);
        self.name_index.insert(name, index);
        Ok(id)
    }

    /// Declare that `task` depends on `depends_on`.
    ///
    /// # Errors
    /// Returns `UnknownTask` if either task is missing and `CycleDetected`
    /// if the edge would close a cycle.
    pub fn add_dependency(&mut self, task: &str, depends_on: &str) -> Result<()> {
        let to_index = self.node_by_name(task)?;
        let from_index = self.node_by_name(depends_on)?;

        if self.graph.find_edge(from_index, to_index).is_some() {
            return Ok(());
        }

        if from_index == to_index || has_path_connecting(&self.graph, to_index, from_index, None)
        {
            return Err(Error::CycleDetected {
                task: task.to_string(),
                depends_on: depends_on.to_string(),
            });
        }

        self.graph.add_edge(from_index, to_index, ());
        Ok(())
    }

    fn node_by_name(&self, name: &str) -> Result<NodeIndex> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownTask(name.to_string()))
    }

    /// Get a task by its ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.task_index
            .get(id)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Get a task by its name.
    pub fn get_by_name(&self, name: &str) -> Option<&Task> {
        self.name_index
            .get(name)
            .and_then(|&index| self.graph.node_weight(index))
    }

    /// Resolve a task name to its ID.
    pub fn id_of(&self, name: &str) -> Option<TaskId> {
        self.get_by_name(name).map(|t| t.id)
    }

    /// Name of a task, or `"?"` for unknown IDs.
    pub fn name_of(&self, id: &TaskId) -> &str {
        self.get(id).map(|t| t.name.as_str()).unwrap_or("?")
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_index.contains_key(name)
    }

    /// Get the number of tasks in the graph.
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Get the number of static dependencies (edges) in the graph.
    pub fn dependency_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Check whether `task` directly depends on `depends_on`.
    pub fn has_dependency(&self, task: &str, depends_on: &str) -> bool {
        match (self.name_index.get(depends_on), self.name_index.get(task)) {
            (Some(&from), Some(&to)) => self.graph.find_edge(from, to).is_some(),
            _ => false,
        }
    }

    /// Tasks that `id` depends on, in declaration order.
    pub fn dependencies(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Tasks that depend on `id`, in declaration order.
    pub fn dependents(&self, id: &TaskId) -> Vec<TaskId> {
        self.neighbors(id, Direction::Outgoing)
    }

    fn neighbors(&self, id: &TaskId, direction: Direction) -> Vec<TaskId> {
        let Some(&index) = self.task_index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(index, direction).collect();
        nodes.sort();
        nodes
            .into_iter()
            .filter_map(|n| self.graph.node_weight(n).map(|t| t.id))
            .collect()
    }

    /// All tasks in declaration order.
    pub fn all_tasks(&self) -> impl Iterator<Item = &Task> {
        self.graph.node_weights()
    }

    /// Tasks without static dependencies, in declaration order.
    pub fn roots(&self) -> Vec<TaskId> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .filter_map(|n| self.graph.node_weight(n).map(|t| t.id))
            .collect()
    }

    /// Get tasks in topological order (respecting static dependencies).
    pub fn topological_order(&self) -> Result<Vec<&Task>> {
        let sorted = toposort(&self.graph, None).map_err(|cycle| {
            let name = self
                .graph
                .node_weight(cycle.node_id())
                .map(|t| t.name.clone())
                .unwrap_or_default();
            Error::CycleDetected {
                task: name.clone(),
                depends_on: name,
            }
        })?;

        Ok(sorted
            .into_iter()
            .filter_map(|index| self.graph.node_weight(index))
            .collect())
    }

    /// Check flow scripts and blocks, producing the control-flow plan.
    pub fn validate(&self) -> Result<FlowPlan> {
        FlowPlan::build(self)
    }
}

impl Default for TaskGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGraph")
            .field("tasks", &self.task_count())
            .field("dependencies", &self.dependency_count())
            .finish()
    }
}
