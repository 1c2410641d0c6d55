use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

/// A study order over a target and its transitive prerequisites.
/// `order` always ends with the target. When `degraded` is set, a
/// prerequisite cycle prevented a true topological order and the
/// prerequisites are listed alphabetically instead; the result is
/// still usable but the ordering carries no dependency guarantee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningPath {
    pub order: Vec<String>,
    pub degraded: bool,
}

/// In-memory prerequisite graph built from an edge list. An edge
/// (source, target) reads "source is a prerequisite of target".
pub struct PrerequisiteGraph {
    graph: DiGraph<String, ()>,
    indices: HashMap<String, NodeIndex>,
}

impl PrerequisiteGraph {
    pub fn from_edges<I, S>(edges: I) -> Self
    where
        I: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut graph = DiGraph::new();
        let mut indices: HashMap<String, NodeIndex> = HashMap::new();

        for (source, target) in edges {
            let source = source.into();
            let target = target.into();
            let source_idx = *indices
                .entry(source.clone())
                .or_insert_with(|| graph.add_node(source));
            let target_idx = *indices
                .entry(target.clone())
                .or_insert_with(|| graph.add_node(target));
            if graph.find_edge(source_idx, target_idx).is_none() {
                graph.add_edge(source_idx, target_idx, ());
            }
        }

        Self { graph, indices }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.indices.contains_key(id)
    }

    /// All transitive prerequisites of `target`, excluding the target
    /// itself. Cycles are fine here; reverse reachability terminates
    /// regardless.
    pub fn ancestor_closure(&self, target: &str) -> HashSet<String> {
        let Some(&start) = self.indices.get(target) else {
            return HashSet::new();
        };

        let mut seen: HashSet<NodeIndex> = HashSet::new();
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for neighbor in self.graph.neighbors_directed(idx, Direction::Incoming) {
                if neighbor != start && seen.insert(neighbor) {
                    stack.push(neighbor);
                }
            }
        }

        seen.into_iter()
            .map(|idx| self.graph[idx].clone())
            .collect()
    }

    /// Orders the target's prerequisite closure so every concept comes
    /// after everything it depends on, target last. Ties break
    /// alphabetically, so the order is stable across runs. A cycle
    /// inside the closure falls back to an alphabetical listing with
    /// the `degraded` flag set rather than failing the request.
    pub fn learning_path(&self, target: &str) -> Option<LearningPath> {
        if !self.contains(target) {
            return None;
        }

        let mut members = self.ancestor_closure(target);
        members.insert(target.to_string());

        let member_indices: HashSet<NodeIndex> = members
            .iter()
            .map(|id| self.indices[id.as_str()])
            .collect();

        // Kahn's algorithm restricted to the closure, popping the
        // smallest ready id first.
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for &idx in &member_indices {
            let degree = self
                .graph
                .neighbors_directed(idx, Direction::Incoming)
                .filter(|n| member_indices.contains(n))
                .count();
            in_degree.insert(idx, degree);
        }

        let mut ready: BinaryHeap<Reverse<(String, NodeIndex)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&idx, _)| Reverse((self.graph[idx].clone(), idx)))
            .collect();

        let mut order = Vec::with_capacity(member_indices.len());
        while let Some(Reverse((id, idx))) = ready.pop() {
            order.push(id);
            for neighbor in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&neighbor) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push(Reverse((self.graph[neighbor].clone(), neighbor)));
                    }
                }
            }
        }

        if order.len() == member_indices.len() {
            return Some(LearningPath {
                order,
                degraded: false,
            });
        }

        // Cycle somewhere in the closure.
        let mut fallback: Vec<String> = members
            .into_iter()
            .filter(|id| id != target)
            .collect();
        fallback.sort();
        fallback.push(target.to_string());

        Some(LearningPath {
            order: fallback,
            degraded: true,
        })
    }
}
