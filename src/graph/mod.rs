use std::collections::BTreeMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::airspace::AirspaceIndex;
use crate::matrix::TransitionMatrix;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("matrix has {matrix} rows but the airspace index holds {index} airspaces")]
    SizeMismatch { matrix: usize, index: usize },
    #[error("weight of edge {from} -> {to} overflows")]
    WeightOverflow { from: String, to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HandoverEdge {
    pub weight: u64,
    /// `weight` divided by the source airspace's outgoing traffic, self-loops
    /// excluded. Only meaningful after [`HandoverGraph::normalize`].
    pub weight_adjusted: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Average {
    Mean,
    Median,
}

/// Directed handover graph keyed by airspace name.
///
/// Every node of the index is present, even with no traffic. Merges leave
/// adjusted weights stale until the next [`HandoverGraph::normalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct HandoverGraph {
    adjacency: BTreeMap<String, BTreeMap<String, HandoverEdge>>,
    normalized: bool,
}

impl Default for HandoverGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl HandoverGraph {
    pub fn new() -> Self {
        Self {
            adjacency: BTreeMap::new(),
            normalized: true,
        }
    }

    pub fn with_nodes(index: &AirspaceIndex) -> Self {
        let mut graph = Self::new();
        for name in index.names() {
            graph.add_node(name);
        }
        graph
    }

    pub fn add_node(&mut self, name: &str) {
        if !self.adjacency.contains_key(name) {
            self.adjacency.insert(name.to_string(), BTreeMap::new());
        }
    }

    /// Adds `amount` to the edge `from -> to`, creating nodes and the edge as
    /// needed. Zero amounts do not create edges. An overflowing weight
    /// leaves the graph untouched.
    pub fn increment_edge(
        &mut self,
        from: &str,
        to: &str,
        amount: u64,
    ) -> Result<(), GraphError> {
        if amount == 0 {
            return Ok(());
        }
        let weight = self.checked_weight(from, to, amount)?;
        self.add_node(to);
        let outgoing = self.adjacency.entry(from.to_string()).or_default();
        outgoing
            .entry(to.to_string())
            .and_modify(|edge| edge.weight = weight)
            .or_insert(HandoverEdge {
                weight,
                weight_adjusted: 0.0,
            });
        self.normalized = false;
        Ok(())
    }

    fn checked_weight(&self, from: &str, to: &str, amount: u64) -> Result<u64, GraphError> {
        self.edge_weight(from, to)
            .checked_add(amount)
            .ok_or_else(|| GraphError::WeightOverflow {
                from: from.to_string(),
                to: to.to_string(),
            })
    }

    /// Folds `delta` into the graph. Matrix ordinals are resolved to names
    /// through `index`, whose order must match the one the matrix was built
    /// against. Either every entry is merged or, on overflow, none is.
    pub fn merge(
        &mut self,
        delta: &TransitionMatrix,
        index: &AirspaceIndex,
    ) -> Result<(), GraphError> {
        if delta.size() != index.len() {
            return Err(GraphError::SizeMismatch {
                matrix: delta.size(),
                index: index.len(),
            });
        }
        let resolved = delta
            .entries()
            .filter_map(|(row, col, count)| {
                let from = index.by_id(row)?;
                let to = index.by_id(col)?;
                Some((from.name.as_str(), to.name.as_str(), count))
            })
            .collect::<Vec<_>>();
        for &(from, to, count) in &resolved {
            self.checked_weight(from, to, count)?;
        }

        for name in index.names() {
            self.add_node(name);
        }
        for &(from, to, count) in &resolved {
            self.increment_edge(from, to, count)?;
        }
        let merged = resolved.len();
        debug!(entries = merged, "merged matrix into handover graph");
        Ok(())
    }

    /// Recomputes every `weight_adjusted` from the current weights.
    pub fn normalize(&mut self) {
        for (name, outgoing) in self.adjacency.iter_mut() {
            let total = outgoing
                .iter()
                .filter(|(to, _)| *to != name)
                .fold(0u64, |acc, (_, edge)| acc.saturating_add(edge.weight));
            for edge in outgoing.values_mut() {
                edge.weight_adjusted = if total != 0 {
                    edge.weight as f64 / total as f64
                } else {
                    0.0
                };
            }
        }
        self.normalized = true;
        info!(
            nodes = self.node_count(),
            edges = self.edge_count(),
            "computed adjusted weights"
        );
    }

    pub fn is_normalized(&self) -> bool {
        self.normalized
    }

    pub fn has_node(&self, name: &str) -> bool {
        self.adjacency.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn edge_count(&self) -> usize {
        self.adjacency.values().map(BTreeMap::len).sum()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.adjacency.keys().map(String::as_str)
    }

    pub fn edges(&self) -> impl Iterator<Item = (&str, &str, &HandoverEdge)> {
        self.adjacency.iter().flat_map(|(from, outgoing)| {
            outgoing
                .iter()
                .map(move |(to, edge)| (from.as_str(), to.as_str(), edge))
        })
    }

    pub fn outgoing(&self, from: &str) -> impl Iterator<Item = (&str, &HandoverEdge)> {
        self.adjacency
            .get(from)
            .into_iter()
            .flat_map(|outgoing| outgoing.iter().map(|(to, edge)| (to.as_str(), edge)))
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&HandoverEdge> {
        self.adjacency.get(from).and_then(|outgoing| outgoing.get(to))
    }

    pub fn edge_weight(&self, from: &str, to: &str) -> u64 {
        self.edge(from, to).map(|edge| edge.weight).unwrap_or(0)
    }

    /// Outgoing traffic of `from`, self-loop excluded, saturating at
    /// `u64::MAX`.
    pub fn total_outgoing(&self, from: &str) -> u64 {
        self.outgoing(from)
            .filter(|(to, _)| *to != from)
            .fold(0u64, |acc, (_, edge)| acc.saturating_add(edge.weight))
    }

    /// Mean or median weight over all edges except self-loops.
    pub fn average_edge_weight(&self, average: Average) -> Option<f64> {
        let mut weights = self
            .edges()
            .filter(|(from, to, _)| from != to)
            .map(|(_, _, edge)| edge.weight)
            .collect::<Vec<_>>();
        if weights.is_empty() {
            return None;
        }
        match average {
            Average::Mean => {
                let total: f64 = weights.iter().map(|&weight| weight as f64).sum();
                Some(total / weights.len() as f64)
            }
            Average::Median => {
                weights.sort_unstable();
                let n = weights.len();
                if n % 2 == 1 {
                    Some(weights[n / 2] as f64)
                } else {
                    Some((weights[n / 2 - 1] as f64 + weights[n / 2] as f64) / 2.0)
                }
            }
        }
    }

    /// Installs an edge with a known adjusted weight, as read back from
    /// storage. Leaves the normalized flag untouched.
    pub(crate) fn restore_edge(&mut self, from: &str, to: &str, edge: HandoverEdge) {
        self.add_node(from);
        self.add_node(to);
        if let Some(outgoing) = self.adjacency.get_mut(from) {
            outgoing.insert(to.to_string(), edge);
        }
    }
}

/// Builds a fresh, normalized graph from one aggregate matrix.
pub fn build(index: &AirspaceIndex, matrix: &TransitionMatrix) -> Result<HandoverGraph, GraphError> {
    let mut graph = HandoverGraph::with_nodes(index);
    graph.merge(matrix, index)?;
    graph.normalize();
    Ok(graph)
}

/// Merges `delta` into an existing graph and renormalizes it.
pub fn merge(
    into: &mut HandoverGraph,
    delta: &TransitionMatrix,
    index: &AirspaceIndex,
) -> Result<(), GraphError> {
    into.merge(delta, index)?;
    into.normalize();
    Ok(())
}
