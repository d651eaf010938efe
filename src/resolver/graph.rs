//! Dependency graph storage and ordering.
//!
//! Nodes are plugin ids and edges are "depends on" references, stored in an
//! arena-indexed graph rather than as owning pointers so cycle detection and
//! dismantling stay straightforward.

use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

use crate::error::{CoreError, Result};
use crate::version::VersionConstraint;

/// A directed graph of plugin ids with "depends on" edges. Edge weights are
/// the constraint the dependent imposes on the dependency.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: DiGraph<String, VersionConstraint>,
    index: HashMap<String, NodeIndex>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node if absent, returning its index.
    pub fn ensure_node(&mut self, id: &str) -> NodeIndex {
        if let Some(idx) = self.index.get(id) {
            return *idx;
        }
        let idx = self.graph.add_node(id.to_string());
        self.index.insert(id.to_string(), idx);
        idx
    }

    /// Record `dependent` depends on `dependency` under `constraint`.
    /// Parallel edges between the same pair are collapsed.
    pub fn add_dependency(
        &mut self,
        dependent: &str,
        dependency: &str,
        constraint: VersionConstraint,
    ) {
        let from = self.ensure_node(dependent);
        let to = self.ensure_node(dependency);
        if self.graph.find_edge(from, to).is_none() {
            self.graph.add_edge(from, to, constraint);
        }
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// All `(dependent, dependency, constraint)` edges.
    pub fn edges(&self) -> Vec<(String, String, VersionConstraint)> {
        self.graph
            .edge_indices()
            .map(|e| {
                let (from, to) = self.graph.edge_endpoints(e).expect("edge endpoints");
                (
                    self.graph[from].clone(),
                    self.graph[to].clone(),
                    self.graph[e],
                )
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cycle detection
    // ─────────────────────────────────────────────────────────────────────────

    /// Three-colour DFS over "depends on" edges. A back-edge fails with
    /// `CircularDependency` carrying the cycle path (e.g. `x -> y -> x`).
    pub fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Colour {
            White,
            Grey,
            Black,
        }

        let mut colour: HashMap<NodeIndex, Colour> = self
            .graph
            .node_indices()
            .map(|n| (n, Colour::White))
            .collect();

        // Deterministic start order.
        let mut starts: Vec<NodeIndex> = self.graph.node_indices().collect();
        starts.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

        for start in starts {
            if colour[&start] != Colour::White {
                continue;
            }
            // Iterative DFS keeping the grey path for diagnostics.
            let mut stack: Vec<(NodeIndex, Vec<NodeIndex>)> = vec![(start, Vec::new())];
            let mut path: Vec<NodeIndex> = Vec::new();

            while let Some((node, _)) = stack.last().cloned() {
                if colour[&node] == Colour::White {
                    colour.insert(node, Colour::Grey);
                    path.push(node);

                    let mut deps: Vec<NodeIndex> = self
                        .graph
                        .neighbors_directed(node, petgraph::Direction::Outgoing)
                        .collect();
                    deps.sort_by(|a, b| self.graph[*a].cmp(&self.graph[*b]));

                    for dep in deps {
                        match colour[&dep] {
                            Colour::Grey => {
                                // Back-edge: reconstruct the cycle from the grey path.
                                let from = path
                                    .iter()
                                    .position(|n| *n == dep)
                                    .unwrap_or(0);
                                let mut names: Vec<&str> =
                                    path[from..].iter().map(|n| self.graph[*n].as_str()).collect();
                                names.push(self.graph[dep].as_str());
                                return Err(CoreError::CircularDependency {
                                    path: names.join(" -> "),
                                });
                            }
                            Colour::White => stack.push((dep, Vec::new())),
                            Colour::Black => {}
                        }
                    }
                } else {
                    stack.pop();
                    if colour[&node] == Colour::Grey {
                        colour.insert(node, Colour::Black);
                        path.pop();
                    }
                }
            }
        }

        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Topological order
    // ─────────────────────────────────────────────────────────────────────────

    /// Kahn emission such that dependencies precede dependents, breaking ties
    /// lexicographically by id for determinism. Fails on cycles (callers run
    /// [`Self::check_cycles`] first for the richer diagnostic).
    pub fn topological_order(&self) -> Result<Vec<String>> {
        // Remaining unemitted dependencies per node.
        let mut pending: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|n| {
                (
                    n,
                    self.graph
                        .neighbors_directed(n, petgraph::Direction::Outgoing)
                        .count(),
                )
            })
            .collect();

        let mut ready: BTreeSet<String> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(n, _)| self.graph[*n].clone())
            .collect();

        let mut order = Vec::with_capacity(self.graph.node_count());

        while let Some(id) = ready.iter().next().cloned() {
            ready.remove(&id);
            let idx = self.index[&id];
            order.push(id);

            let mut dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, petgraph::Direction::Incoming)
                .collect();
            dependents.sort();
            dependents.dedup();

            for dependent in dependents {
                let count = pending.get_mut(&dependent).expect("pending entry");
                *count -= 1;
                if *count == 0 {
                    ready.insert(self.graph[dependent].clone());
                }
            }
        }

        if order.len() != self.graph.node_count() {
            return Err(CoreError::CircularDependency {
                path: "cycle prevented topological ordering".into(),
            });
        }

        Ok(order)
    }
}
