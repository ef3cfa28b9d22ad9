//! Shortest-path queries over the compiled routing graph.

use std::path::Path;

use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use crate::build::CompiledGraph;
use crate::geometry::haversine_m;
use crate::models::Coord;

#[derive(Debug, Clone, PartialEq)]
pub enum RouteError {
    Load(String),
    NoNodeNear { coord: Coord, max_snap_m: f64 },
    Unreachable,
}

impl std::fmt::Display for RouteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouteError::Load(e) => write!(f, "routing graph unreadable: {}", e),
            RouteError::NoNodeNear { coord, max_snap_m } => write!(
                f,
                "no node within {} m of ({}, {})",
                max_snap_m, coord.0, coord.1
            ),
            RouteError::Unreachable => write!(f, "no path between waypoints"),
        }
    }
}

impl std::error::Error for RouteError {}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub distance_m: f64,
    pub duration_s: f64,
    /// Segment ids in travel order.
    pub segments: Vec<String>,
}

pub struct Router {
    graph: CompiledGraph,
    /// Node `i` is compiled node `i`; edge weights index `graph.edges`.
    network: DiGraph<(), usize>,
}

impl Router {
    pub fn new(graph: CompiledGraph) -> Self {
        let n = graph.nodes.len();
        let mut network = DiGraph::with_capacity(n, graph.edges.len());
        for _ in 0..n {
            network.add_node(());
        }
        for (i, e) in graph.edges.iter().enumerate() {
            if e.from < n && e.to < n {
                network.add_edge(NodeIndex::new(e.from), NodeIndex::new(e.to), i);
            }
        }
        Self { graph, network }
    }

    pub fn load(path: &Path) -> Result<Self, RouteError> {
        let bytes = std::fs::read(path).map_err(|e| RouteError::Load(e.to_string()))?;
        let graph: CompiledGraph =
            serde_json::from_slice(&bytes).map_err(|e| RouteError::Load(e.to_string()))?;
        Ok(Self::new(graph))
    }

    /// Nearest node to `c` no further than `max_snap_m`.
    pub fn snap(&self, c: Coord, max_snap_m: f64) -> Result<usize, RouteError> {
        self.graph
            .nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (i, haversine_m((n[0], n[1]), c)))
            .filter(|(_, d)| *d <= max_snap_m)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
            .ok_or(RouteError::NoNodeNear {
                coord: c,
                max_snap_m,
            })
    }

    /// Fastest route between two waypoints.
    pub fn route(&self, from: Coord, to: Coord, max_snap_m: f64) -> Result<Route, RouteError> {
        let start = NodeIndex::new(self.snap(from, max_snap_m)?);
        let goal = NodeIndex::new(self.snap(to, max_snap_m)?);

        let (duration_s, path) = astar(
            &self.network,
            start,
            |n| n == goal,
            |e| self.graph.edges[*e.weight()].duration_s,
            |_| 0.0,
        )
        .ok_or(RouteError::Unreachable)?;

        let mut segments = Vec::with_capacity(path.len().saturating_sub(1));
        let mut distance_m = 0.0;
        for hop in path.windows(2) {
            // Parallel edges: the search took the fastest one.
            let edge = self
                .network
                .edges_connecting(hop[0], hop[1])
                .map(|e| &self.graph.edges[*e.weight()])
                .min_by(|a, b| a.duration_s.total_cmp(&b.duration_s))
                .ok_or(RouteError::Unreachable)?;
            distance_m += edge.length_m;
            segments.push(edge.segment_id.clone());
        }

        Ok(Route {
            distance_m,
            duration_s,
            segments,
        })
    }
}
