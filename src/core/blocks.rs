//! Flow block matching and control-flow validation.
//!
//! `FlowPlan::build` checks every flow script in a [`TaskGraph`] and resolves
//! the regions each construct acts on:
//!
//! - a branch arm is its target task, or the whole `start`..`end` block when
//!   the target opens one
//! - a loop body is every task on a path from the loop target to the task
//!   carrying the loop script
//! - a replicated region is every task strictly between a `start` block
//!   carrying a replicate script and its matching `end` block (the merge)
//!
//! Blocks are matched by walking forward through static edges and branch
//! targets, counting opened `start` blocks until the first `end` that closes
//! the depth back to zero.

use crate::core::graph::TaskGraph;
use crate::core::task::{FlowBlock, FlowScript, Task, TaskId};
use crate::error::{Error, Result};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

/// One side of a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchArm {
    /// Task instantiated when this side is chosen.
    pub entry: TaskId,
    /// Task whose completion triggers the continuation.
    pub terminal: TaskId,
    pub region: BTreeSet<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchPlan {
    pub if_arm: BranchArm,
    pub else_arm: BranchArm,
    pub continuation: TaskId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopPlan {
    pub target: TaskId,
    /// Tasks re-instantiated per iteration, target and holder included.
    pub body: BTreeSet<TaskId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatePlan {
    pub merge: TaskId,
    /// Tasks copied per replica, split and merge excluded.
    pub region: BTreeSet<TaskId>,
    /// Region tasks that depend directly on the split task.
    pub entries: Vec<TaskId>,
    /// Number of region tasks the merge depends on directly.
    pub exits: usize,
}

/// Resolved control-flow structure of a validated job.
#[derive(Debug, Clone, Default)]
pub struct FlowPlan {
    matching_end: HashMap<TaskId, TaskId>,
    branches: HashMap<TaskId, BranchPlan>,
    loops: HashMap<TaskId, LoopPlan>,
    replicates: HashMap<TaskId, ReplicatePlan>,
    /// merge -> split
    merges: HashMap<TaskId, TaskId>,
    branch_targets: HashSet<TaskId>,
    roots: Vec<TaskId>,
}

fn invalid(task: &Task, reason: impl Into<String>) -> Error {
    Error::InvalidFlowScript {
        task: task.name.clone(),
        reason: reason.into(),
    }
}

impl FlowPlan {
    /// Validate the graph and resolve every flow construct.
    pub fn build(graph: &TaskGraph) -> Result<Self> {
        let mut plan = FlowPlan::default();

        let mut succ: HashMap<TaskId, Vec<TaskId>> = graph
            .all_tasks()
            .map(|t| (t.id, graph.dependents(&t.id)))
            .collect();

        for task in graph.all_tasks() {
            let Some(FlowScript::Branch {
                if_target,
                else_target,
                continuation,
                ..
            }) = &task.flow_script
            else {
                continue;
            };
            let resolve = |name: &str| {
                graph
                    .id_of(name)
                    .ok_or_else(|| invalid(task, format!("branch target {} does not exist", name)))
            };
            let (if_id, else_id, cont_id) = (
                resolve(if_target.as_str())?,
                resolve(else_target.as_str())?,
                resolve(continuation.as_str())?,
            );
            if if_id == else_id {
                return Err(invalid(task, "IF and ELSE must name different tasks"));
            }
            if cont_id == if_id || cont_id == else_id {
                return Err(invalid(task, "continuation must differ from IF and ELSE"));
            }
            for target in [if_id, else_id, cont_id] {
                let name = graph.name_of(&target);
                if target == task.id {
                    return Err(invalid(task, "a branch cannot target its own task"));
                }
                if !graph.dependencies(&target).is_empty() {
                    return Err(invalid(
                        task,
                        format!("branch target {} must not have static dependencies", name),
                    ));
                }
                if !plan.branch_targets.insert(target) {
                    return Err(invalid(
                        task,
                        format!("task {} is targeted by more than one branch", name),
                    ));
                }
            }
            succ.entry(task.id)
                .or_default()
                .extend([if_id, else_id, cont_id]);
        }

        let mut pred: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (from, tos) in &succ {
            for to in tos {
                pred.entry(*to).or_default().push(*from);
            }
        }

        plan.match_blocks(graph, &succ)?;

        for task in graph.all_tasks() {
            let Some(FlowScript::Branch {
                if_target,
                else_target,
                continuation,
                ..
            }) = &task.flow_script
            else {
                continue;
            };
            // Targets were resolved above.
            let (Some(if_id), Some(else_id), Some(cont_id)) = (
                graph.id_of(if_target),
                graph.id_of(else_target),
                graph.id_of(continuation),
            ) else {
                continue;
            };
            let branch = BranchPlan {
                if_arm: plan.resolve_arm(graph, &succ, &pred, task, if_id)?,
                else_arm: plan.resolve_arm(graph, &succ, &pred, task, else_id)?,
                continuation: cont_id,
            };
            plan.branches.insert(task.id, branch);
        }

        // Loop bodies and replicated regions follow arms back to their
        // continuation.
        let mut flow_succ = succ.clone();
        for branch in plan.branches.values() {
            for arm in [&branch.if_arm, &branch.else_arm] {
                flow_succ
                    .entry(arm.terminal)
                    .or_default()
                    .push(branch.continuation);
            }
        }
        let mut flow_pred: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for (from, tos) in &flow_succ {
            for to in tos {
                flow_pred.entry(*to).or_default().push(*from);
            }
        }

        for task in graph.all_tasks() {
            match &task.flow_script {
                Some(FlowScript::Loop { target, .. }) => {
                    let target_id = graph.id_of(target).ok_or_else(|| {
                        invalid(task, format!("loop target {} does not exist", target))
                    })?;
                    let backward = reachable(&flow_pred, task.id);
                    if !backward.contains(&target_id) {
                        return Err(invalid(
                            task,
                            format!("loop target {} is not reachable backward from this task", target),
                        ));
                    }
                    let body: BTreeSet<TaskId> = reachable(&flow_succ, target_id)
                        .intersection(&backward)
                        .copied()
                        .collect();
                    for member in body.iter().filter(|m| **m != task.id) {
                        if let Some(outside) = successors(&flow_succ, member).find(|s| !body.contains(s)) {
                            return Err(invalid(
                                task,
                                format!(
                                    "loop body task {} leads to {} outside the loop",
                                    graph.name_of(member),
                                    graph.name_of(&outside)
                                ),
                            ));
                        }
                    }
                    plan.loops.insert(
                        task.id,
                        LoopPlan {
                            target: target_id,
                            body,
                        },
                    );
                }
                Some(FlowScript::Replicate { .. }) => {
                    let replicate = plan.resolve_replicate(graph, &flow_succ, &flow_pred, task)?;
                    plan.merges.insert(replicate.merge, task.id);
                    plan.replicates.insert(task.id, replicate);
                }
                _ => {}
            }
        }

        for (holder, branch) in &plan.branches {
            if plan.merges.contains_key(&branch.continuation) {
                let task = graph
                    .get(holder)
                    .ok_or_else(|| Error::UnknownTask(holder.to_string()))?;
                return Err(invalid(task, "continuation cannot be a merge task"));
            }
        }

        plan.check_nesting(graph)?;

        plan.roots = graph
            .roots()
            .into_iter()
            .filter(|id| !plan.branch_targets.contains(id))
            .collect();

        Ok(plan)
    }

    fn match_blocks(&mut self, graph: &TaskGraph, succ: &HashMap<TaskId, Vec<TaskId>>) -> Result<()> {
        for task in graph.all_tasks().filter(|t| t.is_start()) {
            let end = match_end(graph, succ, task.id)
                .ok_or_else(|| invalid(task, "start block has no matching end block"))?;
            self.matching_end.insert(task.id, end);
        }

        let mut closes: HashMap<TaskId, usize> = HashMap::new();
        for end in self.matching_end.values() {
            *closes.entry(*end).or_default() += 1;
        }
        for task in graph.all_tasks().filter(|t| t.is_end()) {
            match closes.get(&task.id) {
                Some(1) => {}
                Some(_) => return Err(invalid(task, "end block closes more than one start block")),
                None => return Err(invalid(task, "end block has no matching start block")),
            }
        }
        Ok(())
    }

    fn resolve_replicate(
        &self,
        graph: &TaskGraph,
        succ: &HashMap<TaskId, Vec<TaskId>>,
        pred: &HashMap<TaskId, Vec<TaskId>>,
        split: &Task,
    ) -> Result<ReplicatePlan> {
        if !split.is_start() {
            return Err(invalid(split, "replicate script must sit on a start block"));
        }
        let merge = self
            .matching_end
            .get(&split.id)
            .copied()
            .ok_or_else(|| invalid(split, "start block has no matching end block"))?;

        let mut region: BTreeSet<TaskId> = reachable(succ, split.id)
            .intersection(&reachable(pred, merge))
            .copied()
            .collect();
        region.remove(&split.id);
        region.remove(&merge);

        for member in &region {
            if let Some(outside) =
                successors(succ, member).find(|s| *s != merge && !region.contains(s))
            {
                return Err(invalid(
                    split,
                    format!(
                        "replicated task {} leads to {} outside its block",
                        graph.name_of(member),
                        graph.name_of(&outside)
                    ),
                ));
            }
            if let Some(outside) = graph
                .dependencies(member)
                .into_iter()
                .find(|d| *d != split.id && !region.contains(d))
            {
                return Err(invalid(
                    split,
                    format!(
                        "replicated task {} depends on {} outside its block",
                        graph.name_of(member),
                        graph.name_of(&outside)
                    ),
                ));
            }
        }

        let entries = graph
            .dependents(&split.id)
            .into_iter()
            .filter(|d| region.contains(d))
            .collect();
        let exits = graph
            .dependencies(&merge)
            .into_iter()
            .filter(|d| region.contains(d))
            .count();

        Ok(ReplicatePlan {
            merge,
            region,
            entries,
            exits,
        })
    }

    fn resolve_arm(
        &self,
        graph: &TaskGraph,
        succ: &HashMap<TaskId, Vec<TaskId>>,
        pred: &HashMap<TaskId, Vec<TaskId>>,
        holder: &Task,
        entry: TaskId,
    ) -> Result<BranchArm> {
        let (terminal, region) = match self.matching_end.get(&entry) {
            Some(&end) => {
                let region: BTreeSet<TaskId> = reachable(succ, entry)
                    .intersection(&reachable(pred, end))
                    .copied()
                    .collect();
                (end, region)
            }
            None => (entry, BTreeSet::from([entry])),
        };

        for member in &region {
            if let Some(outside) = successors(succ, member).find(|s| !region.contains(s)) {
                return Err(invalid(
                    holder,
                    format!(
                        "branch arm {} leads to {}; rejoin through the continuation instead",
                        graph.name_of(&entry),
                        graph.name_of(&outside)
                    ),
                ));
            }
        }

        Ok(BranchArm {
            entry,
            terminal,
            region,
        })
    }

    /// Loop bodies, replicated blocks and branch arms must nest or be disjoint.
    fn check_nesting(&self, graph: &TaskGraph) -> Result<()> {
        let mut scopes: Vec<(TaskId, BTreeSet<TaskId>)> = Vec::new();
        for (holder, plan) in &self.loops {
            scopes.push((*holder, plan.body.clone()));
        }
        for (split, plan) in &self.replicates {
            let mut block = plan.region.clone();
            block.insert(*split);
            block.insert(plan.merge);
            scopes.push((*split, block));
        }
        for (holder, plan) in &self.branches {
            scopes.push((*holder, plan.if_arm.region.clone()));
            scopes.push((*holder, plan.else_arm.region.clone()));
        }

        for (i, (holder_a, a)) in scopes.iter().enumerate() {
            for (holder_b, b) in scopes.iter().skip(i + 1) {
                let nested = a.is_subset(b) || b.is_subset(a) || a.is_disjoint(b);
                if !nested {
                    let task = graph
                        .get(holder_a)
                        .ok_or_else(|| Error::UnknownTask(holder_a.to_string()))?;
                    return Err(invalid(
                        task,
                        format!(
                            "its block overlaps the block of {} without nesting",
                            graph.name_of(holder_b)
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Tasks instantiated when the job starts.
    pub fn roots(&self) -> &[TaskId] {
        &self.roots
    }

    pub fn matching_end(&self, start: &TaskId) -> Option<TaskId> {
        self.matching_end.get(start).copied()
    }

    pub fn branch(&self, holder: &TaskId) -> Option<&BranchPlan> {
        self.branches.get(holder)
    }

    pub fn looping(&self, holder: &TaskId) -> Option<&LoopPlan> {
        self.loops.get(holder)
    }

    pub fn replicate(&self, split: &TaskId) -> Option<&ReplicatePlan> {
        self.replicates.get(split)
    }

    /// The replicate plan whose merge task is `merge`.
    pub fn replicate_merged_at(&self, merge: &TaskId) -> Option<&ReplicatePlan> {
        self.merges.get(merge).and_then(|split| self.replicates.get(split))
    }

    pub fn is_merge(&self, task: &TaskId) -> bool {
        self.merges.contains_key(task)
    }

    pub fn is_branch_target(&self, task: &TaskId) -> bool {
        self.branch_targets.contains(task)
    }

    pub fn loop_count(&self) -> usize {
        self.loops.len()
    }

    pub fn replicate_count(&self) -> usize {
        self.replicates.len()
    }

    pub fn branch_count(&self) -> usize {
        self.branches.len()
    }
}

fn successors<'a>(
    succ: &'a HashMap<TaskId, Vec<TaskId>>,
    id: &TaskId,
) -> impl Iterator<Item = TaskId> + 'a {
    succ.get(id).into_iter().flatten().copied()
}

/// Every task reachable from `from` through `edges`, `from` included.
fn reachable(edges: &HashMap<TaskId, Vec<TaskId>>, from: TaskId) -> BTreeSet<TaskId> {
    let mut seen = BTreeSet::from([from]);
    let mut queue = VecDeque::from([from]);
    while let Some(node) = queue.pop_front() {
        for next in successors(edges, &node) {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    seen
}

fn match_end(graph: &TaskGraph, succ: &HashMap<TaskId, Vec<TaskId>>, start: TaskId) -> Option<TaskId> {
    let mut queue = VecDeque::from([(start, 1usize)]);
    let mut seen = HashSet::new();
    while let Some((node, depth)) = queue.pop_front() {
        for next in successors(succ, &node) {
            let block = graph.get(&next).map(|t| t.flow_block).unwrap_or_default();
            let depth = match block {
                FlowBlock::Start => depth + 1,
                FlowBlock::End => depth - 1,
                FlowBlock::None => depth,
            };
            if depth == 0 {
                return Some(next);
            }
            if seen.insert((next, depth)) {
                queue.push_back((next, depth));
            }
        }
    }
    None
}
