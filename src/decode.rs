//! Snapshot payload decoding.
//!
//! A snapshot is a GeoJSON `FeatureCollection` in WGS84, either as-is or as
//! the first `.geojson`/`.json` entry of a ZIP archive. Each line feature
//! becomes one [`TrailSegment`]; property values are standardised so that
//! numeric codes compare as strings (`1.0` → `"1"`) and empty values are
//! dropped rather than carried as blanks.

use serde_json::Value;
use std::collections::BTreeMap;
use std::io::Read;

use crate::models::{Coord, TrailSegment};
use crate::geometry::{parse_epsg, GEOGRAPHIC_EPSG};

/// Maximum decompressed bytes read from a single ZIP entry.
const MAX_ENTRY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

#[derive(Debug)]
pub enum DecodeError {
    Archive(String),
    Json(String),
    NotFeatureCollection,
    MissingSegmentId { index: usize, field: String },
    /// The collection declares a CRS other than geographic WGS 84.
    UnsupportedCrs(String),
    /// A coordinate outside lon/lat range: projected data without a `crs`.
    NotGeographic { segment_id: String, coord: Coord },
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Archive(e) => write!(f, "snapshot archive unreadable: {}", e),
            DecodeError::Json(e) => write!(f, "snapshot is not valid JSON: {}", e),
            DecodeError::NotFeatureCollection => {
                write!(f, "snapshot is not a GeoJSON FeatureCollection")
            }
            DecodeError::MissingSegmentId { index, field } => {
                write!(f, "feature #{} has no segment id field '{}'", index, field)
            }
            DecodeError::UnsupportedCrs(name) => write!(
                f,
                "snapshot CRS '{}' is not geographic WGS 84 (select the EPSG:4326 download)",
                name
            ),
            DecodeError::NotGeographic { segment_id, coord } => write!(
                f,
                "segment {} has coordinate ({}, {}) outside lon/lat range; snapshot is projected",
                segment_id, coord.0, coord.1
            ),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decoded segments plus what was left out.
#[derive(Debug)]
pub struct Decoded {
    pub segments: Vec<TrailSegment>,
    /// Point/polygon features ignored by the network.
    pub skipped_non_line: usize,
    /// Multi-line features whose disjoint parts were dropped.
    pub trimmed_multi: Vec<String>,
    /// Raw attribute name → number of line features carrying a value.
    pub attribute_counts: BTreeMap<String, usize>,
}

pub fn decode_snapshot(payload: &[u8], segment_id_field: &str) -> Result<Decoded, DecodeError> {
    let json = if payload.starts_with(b"PK\x03\x04") {
        read_geojson_entry(payload)?
    } else {
        payload.to_vec()
    };

    let root: Value =
        serde_json::from_slice(&json).map_err(|e| DecodeError::Json(e.to_string()))?;
    if root.get("type").and_then(Value::as_str) != Some("FeatureCollection") {
        return Err(DecodeError::NotFeatureCollection);
    }
    let features = root
        .get("features")
        .and_then(Value::as_array)
        .ok_or(DecodeError::NotFeatureCollection)?;
    check_crs(root.get("crs"))?;

    let mut decoded = Decoded {
        segments: Vec::with_capacity(features.len()),
        skipped_non_line: 0,
        trimmed_multi: Vec::new(),
        attribute_counts: BTreeMap::new(),
    };

    for (index, feature) in features.iter().enumerate() {
        let geometry = feature.get("geometry").unwrap_or(&Value::Null);
        let kind = geometry.get("type").and_then(Value::as_str);
        if !matches!(kind, None | Some("LineString") | Some("MultiLineString")) {
            decoded.skipped_non_line += 1;
            continue;
        }

        let attributes = standardize_properties(feature.get("properties"));
        let segment_id = attributes
            .get(segment_id_field)
            .cloned()
            .ok_or_else(|| DecodeError::MissingSegmentId {
                index,
                field: segment_id_field.to_string(),
            })?;

        let (coords, trimmed) = match kind {
            Some("LineString") => (line_coords(geometry.get("coordinates")), false),
            Some("MultiLineString") => merge_parts(geometry.get("coordinates")),
            _ => (Vec::new(), false),
        };
        if let Some(&coord) = coords.iter().find(|c| outside_lon_lat(c)) {
            return Err(DecodeError::NotGeographic { segment_id, coord });
        }
        if trimmed {
            decoded.trimmed_multi.push(segment_id.clone());
        }
        for key in attributes.keys() {
            *decoded.attribute_counts.entry(key.clone()).or_default() += 1;
        }

        decoded.segments.push(TrailSegment {
            segment_id,
            coords,
            attributes,
        });
    }

    Ok(decoded)
}

/// GeoJSON 2008 `crs` member. Absent or null means CRS84.
fn check_crs(crs: Option<&Value>) -> Result<(), DecodeError> {
    let Some(crs) = crs.filter(|v| !v.is_null()) else {
        return Ok(());
    };
    let name = crs
        .pointer("/properties/name")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::UnsupportedCrs(crs.to_string()))?;
    let geographic = name.to_uppercase().ends_with("CRS84")
        || parse_epsg(name).is_some_and(|code| GEOGRAPHIC_EPSG.contains(&code));
    if geographic {
        Ok(())
    } else {
        Err(DecodeError::UnsupportedCrs(name.to_string()))
    }
}

fn outside_lon_lat(c: &Coord) -> bool {
    (c.0.is_finite() && c.0.abs() > 180.0) || (c.1.is_finite() && c.1.abs() > 90.0)
}

fn read_geojson_entry(bytes: &[u8]) -> Result<Vec<u8>, DecodeError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| DecodeError::Archive(e.to_string()))?;
    let name = archive
        .file_names()
        .filter(|n| n.ends_with(".geojson") || n.ends_with(".json"))
        .min()
        .map(|s| s.to_string())
        .ok_or_else(|| DecodeError::Archive("no .geojson or .json entry".to_string()))?;

    let entry = archive
        .by_name(&name)
        .map_err(|e| DecodeError::Archive(e.to_string()))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Archive(e.to_string()))?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(DecodeError::Archive(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, MAX_ENTRY_BYTES
        )));
    }
    Ok(out)
}

/// Whole numbers become integer strings, empty strings and nulls are dropped.
fn standardize_properties(props: Option<&Value>) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let Some(Value::Object(map)) = props else {
        return out;
    };
    for (key, value) in map {
        let standardized = match value {
            Value::Null => None,
            Value::String(s) if s.trim().is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => Some(i.to_string()),
                (None, Some(f)) if f.fract() == 0.0 && f.abs() < 1e15 => {
                    Some(format!("{}", f as i64))
                }
                (None, Some(f)) => Some(f.to_string()),
                (None, None) => Some(n.to_string()),
            },
            Value::Bool(b) => Some(b.to_string()),
            other => Some(other.to_string()),
        };
        if let Some(v) = standardized {
            out.insert(key.clone(), v);
        }
    }
    out
}

fn line_coords(value: Option<&Value>) -> Vec<Coord> {
    let Some(Value::Array(points)) = value else {
        return Vec::new();
    };
    points
        .iter()
        .map(|p| {
            let lon = p.get(0).and_then(Value::as_f64).unwrap_or(f64::NAN);
            let lat = p.get(1).and_then(Value::as_f64).unwrap_or(f64::NAN);
            (lon, lat)
        })
        .collect()
}

/// Concatenates parts whose ends touch; otherwise keeps the longest run of
/// touching parts. The flag reports whether anything was dropped.
fn merge_parts(value: Option<&Value>) -> (Vec<Coord>, bool) {
    let Some(Value::Array(parts)) = value else {
        return (Vec::new(), false);
    };
    let mut runs: Vec<Vec<Coord>> = Vec::new();
    for part in parts {
        let coords = line_coords(Some(part));
        if coords.is_empty() {
            continue;
        }
        match runs.last_mut() {
            Some(run) if run.last() == coords.first() => run.extend(coords.into_iter().skip(1)),
            _ => runs.push(coords),
        }
    }
    let trimmed = runs.len() > 1;
    let longest = runs
        .into_iter()
        .max_by(|a, b| {
            crate::geometry::line_length_m(a)
                .partial_cmp(&crate::geometry::line_length_m(b))
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .unwrap_or_default();
    (longest, trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn collection(features: Value) -> Vec<u8> {
        serde_json::to_vec(&json!({"type": "FeatureCollection", "features": features})).unwrap()
    }

    #[test]
    fn decodes_line_features_and_standardizes_codes() {
        let payload = collection(json!([{
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[10.0, 60.0], [10.1, 60.1]]},
            "properties": {"lokalid": "a1", "underlagstype": 3.0, "rutenavn": "", "gradering": null, "noyaktighet": 2.5}
        }]));
        let decoded = decode_snapshot(&payload, "lokalid").unwrap();
        assert_eq!(decoded.segments.len(), 1);
        let seg = &decoded.segments[0];
        assert_eq!(seg.segment_id, "a1");
        assert_eq!(seg.attr("underlagstype"), Some("3"));
        assert_eq!(seg.attr("noyaktighet"), Some("2.5"));
        assert_eq!(seg.attr("rutenavn"), None);
        assert_eq!(seg.attr("gradering"), None);
        assert_eq!(seg.coords, vec![(10.0, 60.0), (10.1, 60.1)]);
        assert_eq!(decoded.attribute_counts.get("underlagstype"), Some(&1));
        assert!(!decoded.attribute_counts.contains_key("rutenavn"));
    }

    #[test]
    fn skips_points_and_keeps_null_geometry_as_empty() {
        let payload = collection(json!([
            {"type": "Feature", "geometry": {"type": "Point", "coordinates": [10.0, 60.0]}, "properties": {"lokalid": "p"}},
            {"type": "Feature", "geometry": null, "properties": {"lokalid": "e"}}
        ]));
        let decoded = decode_snapshot(&payload, "lokalid").unwrap();
        assert_eq!(decoded.skipped_non_line, 1);
        assert_eq!(decoded.segments.len(), 1);
        assert!(decoded.segments[0].coords.is_empty());
    }

    #[test]
    fn multilinestring_touching_parts_merge() {
        let payload = collection(json!([{
            "type": "Feature",
            "geometry": {"type": "MultiLineString", "coordinates": [
                [[10.0, 60.0], [10.1, 60.0]],
                [[10.1, 60.0], [10.2, 60.0]]
            ]},
            "properties": {"lokalid": "m"}
        }]));
        let decoded = decode_snapshot(&payload, "lokalid").unwrap();
        assert_eq!(decoded.segments[0].coords.len(), 3);
        assert!(decoded.trimmed_multi.is_empty());
    }

    #[test]
    fn multilinestring_disjoint_parts_keep_longest() {
        let payload = collection(json!([{
            "type": "Feature",
            "geometry": {"type": "MultiLineString", "coordinates": [
                [[10.0, 60.0], [10.01, 60.0]],
                [[11.0, 60.0], [11.5, 60.0]]
            ]},
            "properties": {"lokalid": "m"}
        }]));
        let decoded = decode_snapshot(&payload, "lokalid").unwrap();
        assert_eq!(decoded.segments[0].coords[0], (11.0, 60.0));
        assert_eq!(decoded.trimmed_multi, vec!["m".to_string()]);
    }

    #[test]
    fn missing_segment_id_is_an_error() {
        let payload = collection(json!([{
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[10.0, 60.0], [10.1, 60.1]]},
            "properties": {"rutenummer": "T1"}
        }]));
        let err = decode_snapshot(&payload, "lokalid").unwrap_err();
        assert!(matches!(err, DecodeError::MissingSegmentId { index: 0, .. }));
    }

    #[test]
    fn declared_crs_must_be_geographic() {
        let feature = json!([{
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[10.0, 60.0], [10.1, 60.1]]},
            "properties": {"lokalid": "c"}
        }]);
        let with_crs = |name: &str| {
            serde_json::to_vec(&json!({
                "type": "FeatureCollection",
                "crs": {"type": "name", "properties": {"name": name}},
                "features": feature,
            }))
            .unwrap()
        };

        assert!(decode_snapshot(&with_crs("urn:ogc:def:crs:OGC:1.3:CRS84"), "lokalid").is_ok());
        assert!(decode_snapshot(&with_crs("EPSG:4326"), "lokalid").is_ok());
        let err = decode_snapshot(&with_crs("urn:ogc:def:crs:EPSG::25833"), "lokalid").unwrap_err();
        assert!(matches!(&err, DecodeError::UnsupportedCrs(name) if name.contains("25833")));
        assert!(err.to_string().contains("EPSG:4326"));
    }

    #[test]
    fn utm_coordinates_without_crs_are_rejected() {
        let payload = collection(json!([{
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[-32000.0, 6580000.0], [-31900.0, 6580100.0]]},
            "properties": {"lokalid": "utm"}
        }]));
        let err = decode_snapshot(&payload, "lokalid").unwrap_err();
        assert!(matches!(err, DecodeError::NotGeographic { ref segment_id, .. } if segment_id == "utm"));
    }

    #[test]
    fn rejects_non_collection() {
        let err = decode_snapshot(br#"{"type": "Feature"}"#, "lokalid").unwrap_err();
        assert!(matches!(err, DecodeError::NotFeatureCollection));
    }

    #[test]
    fn reads_geojson_from_zip() {
        let payload = collection(json!([{
            "type": "Feature",
            "geometry": {"type": "LineString", "coordinates": [[10.0, 60.0], [10.1, 60.1]]},
            "properties": {"lokalid": "z"}
        }]));
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buf);
            writer
                .start_file("turrutebasen.geojson", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(&payload).unwrap();
            writer.finish().unwrap();
        }
        let decoded = decode_snapshot(buf.get_ref(), "lokalid").unwrap();
        assert_eq!(decoded.segments[0].segment_id, "z");
    }
}
