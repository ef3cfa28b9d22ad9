//! Network assembly.
//!
//! Repairs geometries, enforces segment-identifier uniqueness, and derives
//! node topology by snapping segment endpoints that lie within a fixed
//! tolerance of each other. Logical-trail grouping (by trail number) is kept
//! for reporting only; one trail legitimately owns many segments.

use std::collections::{BTreeMap, HashMap};

use crate::config::AssemblyConfig;
use crate::geometry::{grid_cell, haversine_m, is_valid_line, line_length_m, repair_line};
use crate::models::{
    BBox, CanonicalEdge, Coord, NetworkEdge, NetworkGraph, NetworkNode, Repair, TrailSegment,
};

/// A segment together with its mapped canonical edge.
#[derive(Debug, Clone)]
pub struct MappedSegment {
    pub segment: TrailSegment,
    pub edge: CanonicalEdge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AssemblyError {
    NoSegments,
    DuplicateSegmentId { segment_id: String, count: usize },
    EmptyGeometry { segment_id: String },
    InvalidGeometry { segment_id: String, detail: String },
}

impl std::fmt::Display for AssemblyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssemblyError::NoSegments => write!(f, "snapshot contains no line segments"),
            AssemblyError::DuplicateSegmentId { segment_id, count } => write!(
                f,
                "segment id '{}' appears {} times; segment ids must be unique",
                segment_id, count
            ),
            AssemblyError::EmptyGeometry { segment_id } => {
                write!(f, "segment '{}' has an empty geometry", segment_id)
            }
            AssemblyError::InvalidGeometry { segment_id, detail } => write!(
                f,
                "segment '{}' geometry is invalid after repair: {}",
                segment_id, detail
            ),
        }
    }
}

impl std::error::Error for AssemblyError {}

pub fn assemble(
    mut segments: Vec<MappedSegment>,
    trail_number_field: &str,
    config: &AssemblyConfig,
) -> Result<NetworkGraph, AssemblyError> {
    if segments.is_empty() {
        return Err(AssemblyError::NoSegments);
    }

    check_unique_ids(segments.iter().map(|s| s.segment.segment_id.as_str()))?;
    segments.sort_by(|a, b| a.segment.segment_id.cmp(&b.segment.segment_id));

    let mut repairs = Vec::new();
    let mut trails: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut snapper = Snapper::new(config.snap_tolerance_m);
    let mut edges = Vec::with_capacity(segments.len());

    for MappedSegment { segment, edge } in segments {
        let segment_id = segment.segment_id.clone();
        if segment.coords.is_empty() {
            return Err(AssemblyError::EmptyGeometry { segment_id });
        }

        let coords = if is_valid_line(&segment.coords) && !has_repeats(&segment.coords) {
            segment.coords
        } else {
            let (fixed, removed) = repair_line(&segment.coords);
            if !is_valid_line(&fixed) {
                return Err(AssemblyError::InvalidGeometry {
                    segment_id,
                    detail: format!(
                        "{} usable vertices remain of {}",
                        fixed.len(),
                        segment.coords.len()
                    ),
                });
            }
            tracing::debug!(segment = %segment_id, removed, "repaired geometry");
            repairs.push(Repair {
                segment_id: segment_id.clone(),
                removed_vertices: removed,
            });
            fixed
        };

        if let Some(trail) = segment.attributes.get(trail_number_field) {
            trails
                .entry(trail.clone())
                .or_default()
                .push(segment_id.clone());
        }

        // Both ends exist: a valid line has at least two vertices.
        let from_node = snapper.node_for(coords[0]);
        let to_node = snapper.node_for(coords[coords.len() - 1]);
        edges.push(NetworkEdge {
            length_m: line_length_m(&coords),
            edge,
            coords,
            from_node,
            to_node,
        });
    }

    let bbox = BBox::from_points(edges.iter().flat_map(|e| e.coords.iter()));

    tracing::info!(
        edges = edges.len(),
        nodes = snapper.nodes.len(),
        trails = trails.len(),
        repairs = repairs.len(),
        "network assembled"
    );

    Ok(NetworkGraph {
        edges,
        nodes: snapper.nodes,
        trails,
        repairs,
        bbox,
    })
}

/// Fails on the first (lexicographically smallest) duplicated id.
pub fn check_unique_ids<'a, I>(ids: I) -> Result<(), AssemblyError>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for id in ids {
        *counts.entry(id).or_insert(0) += 1;
    }
    match counts.into_iter().find(|(_, n)| *n > 1) {
        Some((id, count)) => Err(AssemblyError::DuplicateSegmentId {
            segment_id: id.to_string(),
            count,
        }),
        None => Ok(()),
    }
}

fn has_repeats(coords: &[Coord]) -> bool {
    coords.windows(2).any(|w| w[0] == w[1])
}

/// Assigns node ids to endpoints, merging endpoints within tolerance.
struct Snapper {
    tolerance_m: f64,
    nodes: Vec<NetworkNode>,
    grid: HashMap<(i64, i64), Vec<usize>>,
}

impl Snapper {
    fn new(tolerance_m: f64) -> Self {
        Self {
            tolerance_m,
            nodes: Vec::new(),
            grid: HashMap::new(),
        }
    }

    fn node_for(&mut self, c: Coord) -> usize {
        let (cx, cy) = grid_cell(c, self.tolerance_m);
        let mut best: Option<(usize, f64)> = None;
        for dx in -1..=1 {
            for dy in -1..=1 {
                let Some(ids) = self.grid.get(&(cx + dx, cy + dy)) else {
                    continue;
                };
                for &id in ids {
                    let d = haversine_m(self.nodes[id].coord, c);
                    if d <= self.tolerance_m && best.map_or(true, |(_, bd)| d < bd) {
                        best = Some((id, d));
                    }
                }
            }
        }
        if let Some((id, _)) = best {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(NetworkNode { id, coord: c });
        self.grid.entry((cx, cy)).or_default().push(id);
        id
    }
}
