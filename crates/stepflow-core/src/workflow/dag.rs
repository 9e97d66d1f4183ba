//! Dependency graph, cycle detection, and readiness computation.
//!
//! Uses `petgraph` to model step dependencies as a directed graph (edge from
//! dependency to dependent). Strongly connected components name every step
//! on a cycle. Once built, the graph answers the scheduler's two questions:
//! which steps may start now (`ready`) and which can never start because an
//! upstream step failed (`skippable`).

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use stepflow_types::workflow::{Step, StepId, StepStatus};

use super::plan::PlanError;
use super::state::ExecutionState;

/// Validated, immutable dependency DAG for one plan.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// step -> steps it depends on
    dependencies: BTreeMap<StepId, BTreeSet<StepId>>,
    /// step -> steps that depend on it
    dependents: BTreeMap<StepId, BTreeSet<StepId>>,
    /// Topological order, ties broken by ascending ID.
    order: Vec<StepId>,
}

impl DependencyGraph {
    /// Build and validate the graph for `steps`.
    ///
    /// Fails on duplicate IDs, dependencies on unknown steps, and cycles
    /// (including a step that depends on itself).
    pub fn build(steps: &[Step]) -> Result<Self, PlanError> {
        let mut graph = DiGraph::<StepId, ()>::new();
        let mut index: HashMap<StepId, NodeIndex> = HashMap::with_capacity(steps.len());
        for step in steps {
            if index.insert(step.id, graph.add_node(step.id)).is_some() {
                return Err(PlanError::DuplicateStep(step.id));
            }
        }

        let mut dependencies: BTreeMap<StepId, BTreeSet<StepId>> = BTreeMap::new();
        let mut dependents: BTreeMap<StepId, BTreeSet<StepId>> = BTreeMap::new();
        for step in steps {
            dependencies.insert(step.id, step.depends_on.clone());
            dependents.entry(step.id).or_default();
            for &dep in &step.depends_on {
                let from = index.get(&dep).ok_or(PlanError::UnknownDependency {
                    step: step.id,
                    dependency: dep,
                })?;
                graph.add_edge(*from, index[&step.id], ());
                dependents.entry(dep).or_default().insert(step.id);
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(PlanError::CycleDetected {
                steps: cycle_members(&graph),
            });
        }

        let order = deterministic_order(&dependencies, &dependents);
        Ok(Self {
            dependencies,
            dependents,
            order,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: StepId) -> bool {
        self.dependencies.contains_key(&id)
    }

    /// All step IDs in topological order (ascending ID among independent steps).
    pub fn topological_order(&self) -> &[StepId] {
        &self.order
    }

    /// Direct dependencies of `id`. Empty for unknown steps.
    pub fn dependencies(&self, id: StepId) -> impl Iterator<Item = StepId> + '_ {
        self.dependencies.get(&id).into_iter().flatten().copied()
    }

    /// Steps that directly depend on `id`. Empty for unknown steps.
    pub fn dependents(&self, id: StepId) -> impl Iterator<Item = StepId> + '_ {
        self.dependents.get(&id).into_iter().flatten().copied()
    }

    /// Transitive closure of the dependencies of `id`.
    pub fn ancestors(&self, id: StepId) -> BTreeSet<StepId> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for dep in self.dependencies(current) {
                if visited.insert(dep) {
                    stack.push(dep);
                }
            }
        }
        visited
    }

    /// Group steps into parallel layers by dependency depth.
    ///
    /// Wave 0 holds root steps; every step sits one wave after its deepest
    /// dependency. Steps within a wave are ascending.
    pub fn waves(&self) -> Vec<Vec<StepId>> {
        let mut depths: HashMap<StepId, usize> = HashMap::new();
        let mut waves: Vec<Vec<StepId>> = Vec::new();
        for &id in &self.order {
            let depth = self
                .dependencies(id)
                .map(|dep| depths.get(&dep).copied().unwrap_or(0) + 1)
                .max()
                .unwrap_or(0);
            depths.insert(id, depth);
            if waves.len() <= depth {
                waves.resize_with(depth + 1, Vec::new);
            }
            waves[depth].push(id);
        }
        for wave in &mut waves {
            wave.sort_unstable();
        }
        waves
    }

    /// Pending steps whose dependencies are all Completed, ascending by ID.
    pub fn ready(&self, state: &ExecutionState) -> Vec<StepId> {
        self.dependencies
            .iter()
            .filter(|(id, _)| state.status(**id) == Some(StepStatus::Pending))
            .filter(|(_, deps)| {
                deps.iter()
                    .all(|d| state.status(*d) == Some(StepStatus::Completed))
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Pending steps that can never run because an upstream step failed.
    ///
    /// A step qualifies when every dependency is terminal (or itself about to
    /// be skipped) and at least one is Failed or Skipped. Evaluated in
    /// topological order so a whole downstream chain is returned in one call.
    pub fn skippable(&self, state: &ExecutionState) -> Vec<StepId> {
        let mut skipped: BTreeSet<StepId> = BTreeSet::new();
        let mut result = Vec::new();
        for &id in &self.order {
            if state.status(id) != Some(StepStatus::Pending) {
                continue;
            }
            let mut all_terminal = true;
            let mut any_blocked = false;
            for dep in self.dependencies(id) {
                if skipped.contains(&dep) {
                    any_blocked = true;
                    continue;
                }
                match state.status(dep) {
                    Some(StepStatus::Failed) | Some(StepStatus::Skipped) => any_blocked = true,
                    Some(StepStatus::Completed) => {}
                    _ => all_terminal = false,
                }
            }
            if all_terminal && any_blocked {
                skipped.insert(id);
                result.push(id);
            }
        }
        result
    }

    /// Steps that are blocked by `id` having failed: its transitive dependents.
    pub fn descendants(&self, id: StepId) -> BTreeSet<StepId> {
        let mut visited = BTreeSet::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            for child in self.dependents(current) {
                if visited.insert(child) {
                    stack.push(child);
                }
            }
        }
        visited
    }
}

/// Every node on a cycle: members of non-trivial SCCs plus self-loops.
fn cycle_members(graph: &DiGraph<StepId, ()>) -> Vec<StepId> {
    let mut members: Vec<StepId> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .map(|n| graph[n])
        .collect();
    members.sort_unstable();
    members
}

/// Kahn's algorithm with a min-heap so independent steps come out ascending.
fn deterministic_order(
    dependencies: &BTreeMap<StepId, BTreeSet<StepId>>,
    dependents: &BTreeMap<StepId, BTreeSet<StepId>>,
) -> Vec<StepId> {
    let mut in_degree: HashMap<StepId, usize> =
        dependencies.iter().map(|(id, d)| (*id, d.len())).collect();
    let mut heap: BinaryHeap<Reverse<StepId>> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();
    let mut order = Vec::with_capacity(dependencies.len());
    while let Some(Reverse(id)) = heap.pop() {
        order.push(id);
        for child in dependents.get(&id).into_iter().flatten() {
            if let Some(deg) = in_degree.get_mut(child) {
                *deg -= 1;
                if *deg == 0 {
                    heap.push(Reverse(*child));
                }
            }
        }
    }
    order
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
