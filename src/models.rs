//! Core data models used throughout trailforge.
//!
//! These types represent the snapshot, segments, canonical edges, and
//! assembled network that flow through the release pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// `(lon, lat)` in WGS84 degrees.
pub type Coord = (f64, f64);

/// A downloaded source payload. Immutable once fetched.
#[derive(Debug, Clone)]
pub struct SourceSnapshot {
    pub payload: Vec<u8>,
    /// Feed-provided version marker (e.g. the ATOM `updated` timestamp).
    pub version: String,
    pub checksum: Option<String>,
    pub source_url: String,
    pub fetched_at: DateTime<Utc>,
}

/// One contiguous geometry record from the source dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct TrailSegment {
    /// Unique across the whole dataset.
    pub segment_id: String,
    pub coords: Vec<Coord>,
    /// Raw attribute name → standardised raw value. Missing values are absent.
    pub attributes: BTreeMap<String, String>,
}

impl TrailSegment {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).map(String::as_str)
    }
}

/// What the route is used for, from the object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activity {
    Hiking,
    Skiing,
    Cycling,
    Other,
    Unspecified,
}

/// Physical kind of way the route runs along.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WayType {
    Road,
    Track,
    Path,
    Footway,
    Cycleway,
    Terrain,
    Waterway,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Moderate,
    Strenuous,
    Expert,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Paved,
    Gravel,
    Natural,
    Other,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marking {
    Marked,
    Unmarked,
    SeasonallyMarked,
    Unspecified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Season {
    Summer,
    Winter,
    YearRound,
    Unspecified,
}

/// How an attribute value was obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Provenance {
    /// Read from the attribute's own source field.
    Authoritative,
    /// Derived from a correlated field.
    Inferred { from: String },
    /// Neither the field nor an inference rule produced a value.
    Absent,
}

/// A tier-2 attribute with explicit provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributed<T> {
    pub value: T,
    pub provenance: Provenance,
    /// 1.0 for authoritative values, the rule's confidence for inferred ones.
    pub confidence: f64,
}

impl<T> Attributed<T> {
    pub fn is_inferred(&self) -> bool {
        matches!(self.provenance, Provenance::Inferred { .. })
    }
}

/// Sparse attributes; `None` means absent, never a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Conditional {
    pub season: Option<Season>,
    pub lit: Option<bool>,
    pub signposted: Option<bool>,
    pub width_class: Option<String>,
    pub traffic_class: Option<String>,
}

/// The canonical representation of one segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEdge {
    pub segment_id: String,
    pub activity: Activity,
    pub way: WayType,
    /// Canonical route-follows class (e.g. `path`, `forest_road`).
    pub follows: Option<String>,
    pub marking: Marking,
    pub name: Option<String>,
    pub reference: Option<String>,
    pub difficulty: Attributed<Difficulty>,
    pub surface: Attributed<Surface>,
    pub conditional: Conditional,
    pub maintainer: Option<String>,
    /// In `[0, 1]`; used to prefer among equivalent alternates.
    pub confidence: f64,
}

/// Axis-aligned bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

/// An edge in the assembled network.
#[derive(Debug, Clone, PartialEq)]
pub struct NetworkEdge {
    pub edge: CanonicalEdge,
    pub coords: Vec<Coord>,
    pub length_m: f64,
    pub from_node: usize,
    pub to_node: usize,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetworkNode {
    pub id: usize,
    pub coord: Coord,
}

/// A geometry fix applied during assembly.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Repair {
    pub segment_id: String,
    pub removed_vertices: usize,
}

/// Every edge plus derived node topology.
#[derive(Debug, Clone)]
pub struct NetworkGraph {
    pub edges: Vec<NetworkEdge>,
    pub nodes: Vec<NetworkNode>,
    /// Trail number → segment ids. Informational only.
    pub trails: BTreeMap<String, Vec<String>>,
    pub repairs: Vec<Repair>,
    pub bbox: Option<BBox>,
}

impl NetworkGraph {
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
