//! Quality validation.
//!
//! A fixed battery of checks runs against every candidate artifact. All
//! checks always run and are recorded in the [`QualityReport`], which is
//! persisted whether or not the candidate passes; a single failure blocks
//! the release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::assemble::check_unique_ids;
use crate::build::{BuiltArtifact, ROUTING_GRAPH_FILE};
use crate::config::QualityConfig;
use crate::geometry::{haversine_m, is_valid_line};
use crate::models::{BBox, NetworkGraph};
use crate::release::ReleaseManifest;
use crate::routing::Router;

/// Absorbs float noise when comparing a ratio with its threshold.
const RATIO_EPSILON: f64 = 1e-9;

pub const EDGE_COUNT_STABILITY: &str = "edge_count_stability";
pub const BBOX_ENVELOPE: &str = "bbox_envelope";
pub const BBOX_CENTER_SHIFT: &str = "bbox_center_shift";
pub const SEGMENT_ID_UNIQUENESS: &str = "segment_id_uniqueness";
pub const GEOMETRY_VALIDITY: &str = "geometry_validity";
pub const ROUTING_SMOKE_TEST: &str = "routing_smoke_test";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub measured: Option<f64>,
    pub threshold: Option<f64>,
    pub detail: String,
}

impl CheckResult {
    fn new(name: &str, passed: bool, measured: Option<f64>, threshold: Option<f64>) -> Self {
        Self {
            name: name.to_string(),
            passed,
            measured,
            threshold,
            detail: String::new(),
        }
    }

    fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityReport {
    pub run_id: String,
    pub source_version: String,
    pub generated_at: DateTime<Utc>,
    pub passed: bool,
    pub checks: Vec<CheckResult>,
}

impl QualityReport {
    pub fn failures(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn check(&self, name: &str) -> Option<&CheckResult> {
        self.checks.iter().find(|c| c.name == name)
    }

    pub fn ensure_passed(&self) -> Result<(), ValidationError> {
        if self.passed {
            return Ok(());
        }
        Err(ValidationError {
            failed: self.failures().into_iter().cloned().collect(),
        })
    }
}

/// One or more checks failed.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub failed: Vec<CheckResult>,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} quality check(s) failed", self.failed.len())?;
        for c in &self.failed {
            write!(f, "\n  {}:", c.name)?;
            if let Some(m) = c.measured {
                write!(f, " measured {}", m)?;
            }
            if let Some(t) = c.threshold {
                write!(f, " vs threshold {}", t)?;
            }
            if !c.detail.is_empty() {
                write!(f, " ({})", c.detail)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

pub fn validate(
    artifact: &BuiltArtifact,
    graph: &NetworkGraph,
    previous: Option<&ReleaseManifest>,
    config: &QualityConfig,
    run_id: &str,
    source_version: &str,
) -> QualityReport {
    let envelope = BBox::from_array(config.envelope);
    let checks = vec![
        edge_count_stability(graph.edge_count(), previous, config.max_edge_drop),
        bbox_envelope(graph.bbox.as_ref(), &envelope),
        bbox_center_shift(graph.bbox.as_ref(), previous, config.max_center_shift_km),
        segment_id_uniqueness(graph),
        geometry_validity(graph),
        routing_smoke_test(artifact, config),
    ];

    for c in checks.iter().filter(|c| !c.passed) {
        tracing::warn!(
            check = %c.name,
            measured = ?c.measured,
            threshold = ?c.threshold,
            detail = %c.detail,
            "quality check failed"
        );
    }

    QualityReport {
        run_id: run_id.to_string(),
        source_version: source_version.to_string(),
        generated_at: Utc::now(),
        passed: checks.iter().all(|c| c.passed),
        checks,
    }
}

pub fn edge_count_stability(
    current: usize,
    previous: Option<&ReleaseManifest>,
    max_drop: f64,
) -> CheckResult {
    let Some(prev) = previous.filter(|p| p.edge_count > 0) else {
        return CheckResult::new(EDGE_COUNT_STABILITY, true, None, Some(max_drop))
            .detail("no previous release to compare against");
    };
    let drop = (prev.edge_count as f64 - current as f64) / prev.edge_count as f64;
    let drop = drop.max(0.0);
    CheckResult::new(
        EDGE_COUNT_STABILITY,
        drop <= max_drop + RATIO_EPSILON,
        Some(drop),
        Some(max_drop),
    )
    .detail(format!("{} edges vs {} previously", current, prev.edge_count))
}

pub fn bbox_envelope(bbox: Option<&BBox>, envelope: &BBox) -> CheckResult {
    match bbox {
        Some(b) if envelope.contains(b) => CheckResult::new(BBOX_ENVELOPE, true, None, None),
        Some(b) => CheckResult::new(BBOX_ENVELOPE, false, None, None).detail(format!(
            "bbox [{}, {}, {}, {}] outside envelope [{}, {}, {}, {}]",
            b.min_lon,
            b.min_lat,
            b.max_lon,
            b.max_lat,
            envelope.min_lon,
            envelope.min_lat,
            envelope.max_lon,
            envelope.max_lat
        )),
        None => CheckResult::new(BBOX_ENVELOPE, false, None, None).detail("network has no extent"),
    }
}

pub fn bbox_center_shift(
    bbox: Option<&BBox>,
    previous: Option<&ReleaseManifest>,
    max_shift_km: f64,
) -> CheckResult {
    let (Some(current), Some(prev)) = (bbox, previous.and_then(|p| p.bbox.as_ref())) else {
        return CheckResult::new(BBOX_CENTER_SHIFT, true, None, Some(max_shift_km))
            .detail("no previous extent to compare against");
    };
    let shift_km = haversine_m(current.center(), prev.center()) / 1000.0;
    CheckResult::new(
        BBOX_CENTER_SHIFT,
        shift_km <= max_shift_km,
        Some(shift_km),
        Some(max_shift_km),
    )
}

pub fn segment_id_uniqueness(graph: &NetworkGraph) -> CheckResult {
    match check_unique_ids(graph.edges.iter().map(|e| e.edge.segment_id.as_str())) {
        Ok(()) => CheckResult::new(SEGMENT_ID_UNIQUENESS, true, Some(0.0), Some(0.0)),
        Err(e) => CheckResult::new(SEGMENT_ID_UNIQUENESS, false, None, Some(0.0)).detail(e.to_string()),
    }
}

pub fn geometry_validity(graph: &NetworkGraph) -> CheckResult {
    let invalid: Vec<&str> = graph
        .edges
        .iter()
        .filter(|e| !is_valid_line(&e.coords))
        .map(|e| e.edge.segment_id.as_str())
        .collect();
    let check = CheckResult::new(
        GEOMETRY_VALIDITY,
        invalid.is_empty(),
        Some(invalid.len() as f64),
        Some(0.0),
    );
    if invalid.is_empty() {
        check
    } else {
        check.detail(format!("invalid: {}", invalid.join(", ")))
    }
}

pub fn routing_smoke_test(artifact: &BuiltArtifact, config: &QualityConfig) -> CheckResult {
    if config.smoke_routes.is_empty() {
        return CheckResult::new(ROUTING_SMOKE_TEST, false, Some(0.0), None)
            .detail("no smoke-test waypoint pairs configured");
    }

    // Route on the file that gets published, not the in-memory graph.
    let router = match Router::load(&artifact.dir.join(ROUTING_GRAPH_FILE)) {
        Ok(router) => router,
        Err(e) => {
            return CheckResult::new(ROUTING_SMOKE_TEST, false, None, Some(0.0))
                .detail(format!("{}: {}", ROUTING_GRAPH_FILE, e));
        }
    };
    let mut failures = Vec::new();
    for r in &config.smoke_routes {
        let from = (r.from[0], r.from[1]);
        let to = (r.to[0], r.to[1]);
        match router.route(from, to, config.max_snap_m) {
            Ok(route) if route.distance_m > 0.0 && route.duration_s > 0.0 => {
                tracing::debug!(
                    route = %r.name,
                    distance_m = route.distance_m,
                    duration_s = route.duration_s,
                    "smoke route ok"
                );
            }
            Ok(_) => failures.push(format!("{}: zero-length route", r.name)),
            Err(e) => failures.push(format!("{}: {}", r.name, e)),
        }
    }

    let check = CheckResult::new(
        ROUTING_SMOKE_TEST,
        failures.is_empty(),
        Some(failures.len() as f64),
        Some(0.0),
    );
    if failures.is_empty() {
        check.detail(format!("{} route(s) ok", config.smoke_routes.len()))
    } else {
        check.detail(failures.join("; "))
    }
}
