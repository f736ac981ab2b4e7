//! Step dependency graph and conflict-aware batch planning.
//!
//! `plan_batches` turns a flat step list into an ordered list of batches.
//! Every step in a batch has its dependencies satisfied by earlier batches,
//! no two steps in a batch write the same file, and a non-parallelizable
//! step always runs alone.

use crate::core::step::{Step, StepId};
use crate::error::{Error, Result};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet};

/// A group of steps that can be dispatched concurrently.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub steps: Vec<Step>,
}

impl Batch {
    pub fn ids(&self) -> Vec<&StepId> {
        self.steps.iter().map(|s| &s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Comma-separated step ids, for log lines.
    pub fn label(&self) -> String {
        self.steps
            .iter()
            .map(|s| s.id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Dependency graph over a plan's steps.
///
/// Edges point from a step to each step it depends on. The edge weight is
/// the position of the dependency in the step's declaration so traversal
/// follows the order the plan author wrote.
pub struct StepGraph {
    graph: DiGraph<StepId, usize>,
    index: HashMap<StepId, NodeIndex>,
}

impl StepGraph {
    /// Build the graph, checking that ids are unique and every dependency
    /// names an existing step. All referential errors are collected.
    pub fn build(steps: &[Step]) -> std::result::Result<Self, Vec<String>> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut errors = Vec::new();

        for step in steps {
            if index.contains_key(&step.id) {
                errors.push(format!("Duplicate step ID found: {}", step.id));
                continue;
            }
            let node = graph.add_node(step.id.clone());
            index.insert(step.id.clone(), node);
        }

        for step in steps {
            let from = index[&step.id];
            for (position, dep) in step.dependencies.iter().enumerate() {
                match index.get(dep) {
                    Some(&to) => {
                        graph.add_edge(from, to, position);
                    }
                    None => errors.push(format!(
                        "Step {} has a dependency on undefined step ID: {}",
                        step.id, dep
                    )),
                }
            }
        }

        if errors.is_empty() {
            Ok(Self { graph, index })
        } else {
            Err(errors)
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Dependencies of a step in declaration order.
    fn ordered_dependencies(&self, node: NodeIndex) -> Vec<NodeIndex> {
        let mut edges: Vec<_> = self
            .graph
            .edges(node)
            .map(|e| (*e.weight(), e.target()))
            .collect();
        edges.sort_by_key(|(position, _)| *position);
        edges.into_iter().map(|(_, target)| target).collect()
    }

    /// Steps that directly depend on `id`.
    pub fn dependents(&self, id: &StepId) -> Vec<&StepId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(node, petgraph::Direction::Incoming)
            .map(|n| &self.graph[n])
            .collect()
    }

    /// Depth-first search with a recursion stack.
    ///
    /// Returns the first back edge found as `(current, dependency)`. Roots
    /// are visited in the order the steps were declared.
    pub fn find_cycle(&self) -> Option<(StepId, StepId)> {
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();

        for node in self.graph.node_indices() {
            if !visited.contains(&node) {
                if let Some(edge) = self.visit(node, &mut visited, &mut on_stack) {
                    return Some(edge);
                }
            }
        }
        None
    }

    fn visit(
        &self,
        node: NodeIndex,
        visited: &mut HashSet<NodeIndex>,
        on_stack: &mut HashSet<NodeIndex>,
    ) -> Option<(StepId, StepId)> {
        visited.insert(node);
        on_stack.insert(node);

        for dep in self.ordered_dependencies(node) {
            if !visited.contains(&dep) {
                if let Some(edge) = self.visit(dep, visited, on_stack) {
                    return Some(edge);
                }
            } else if on_stack.contains(&dep) {
                return Some((self.graph[node].clone(), self.graph[dep].clone()));
            }
        }

        on_stack.remove(&node);
        None
    }
}

impl std::fmt::Debug for StepGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepGraph")
            .field("steps", &self.graph.node_count())
            .field("dependencies", &self.graph.edge_count())
            .finish()
    }
}

/// Validate `steps` and partition them into ordered batches.
///
/// Validation short-circuits: referential errors suppress the cycle check,
/// and a cycle suppresses batching. Failures come back as
/// [`Error::PlanInvalid`] carrying every collected message.
pub fn plan_batches(steps: &[Step]) -> Result<Vec<Batch>> {
    if steps.is_empty() {
        return Ok(Vec::new());
    }

    let graph = StepGraph::build(steps).map_err(Error::PlanInvalid)?;

    if let Some((current, dep)) = graph.find_cycle() {
        return Err(Error::PlanInvalid(vec![format!(
            "Circular dependency detected involving step ID: {} and {}",
            current, dep
        )]));
    }

    build_batches(steps)
}

/// Greedy round-based batching. Each round walks the remaining steps in
/// input order and builds exactly one batch.
fn build_batches(steps: &[Step]) -> Result<Vec<Batch>> {
    let mut remaining: Vec<&Step> = steps.iter().collect();
    let mut completed: HashSet<&StepId> = HashSet::new();
    let mut batches = Vec::new();

    while !remaining.is_empty() {
        let mut batch: Vec<&Step> = Vec::new();
        let mut claimed: HashSet<&str> = HashSet::new();
        let mut deferred: Vec<&Step> = Vec::new();
        let mut exclusive = false;

        for step in remaining {
            if exclusive {
                deferred.push(step);
                continue;
            }

            let ready = step.dependencies.iter().all(|d| completed.contains(d));
            if !ready {
                deferred.push(step);
                continue;
            }

            if !step.parallelizable {
                if batch.is_empty() {
                    exclusive = true;
                    batch.push(step);
                } else {
                    deferred.push(step);
                }
                continue;
            }

            let conflict = step
                .target_files
                .iter()
                .any(|f| claimed.contains(f.as_str()));
            if conflict {
                deferred.push(step);
            } else {
                claimed.extend(step.target_files.iter().map(String::as_str));
                batch.push(step);
            }
        }

        if batch.is_empty() {
            let stuck = deferred
                .iter()
                .map(|s| s.id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Error::PlanInvalid(vec![format!(
                "Failed to resolve dependencies for remaining steps [{}]. This is likely an internal error or unresolved cycle.",
                stuck
            )]));
        }

        completed.extend(batch.iter().map(|s| &s.id));
        batches.push(Batch {
            steps: batch.into_iter().cloned().collect(),
        });
        remaining = deferred;
    }

    Ok(batches)
}
