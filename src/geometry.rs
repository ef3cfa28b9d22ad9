//! Small WGS84 geometry helpers for line features.

use crate::models::{BBox, Coord};

const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Great-circle distance in metres.
pub fn haversine_m(a: Coord, b: Coord) -> f64 {
    let (lon1, lat1) = (a.0.to_radians(), a.1.to_radians());
    let (lon2, lat2) = (b.0.to_radians(), b.1.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

pub fn line_length_m(coords: &[Coord]) -> f64 {
    coords.windows(2).map(|w| haversine_m(w[0], w[1])).sum()
}

fn is_finite(c: Coord) -> bool {
    c.0.is_finite() && c.1.is_finite()
}

/// A line is valid when every coordinate is finite and it has at least two
/// distinct vertices. Self-intersection is allowed for lines.
pub fn is_valid_line(coords: &[Coord]) -> bool {
    if coords.len() < 2 || !coords.iter().all(|c| is_finite(*c)) {
        return false;
    }
    coords.windows(2).any(|w| w[0] != w[1])
}

/// Zero-distance repair: drops non-finite coordinates and consecutive
/// coincident vertices. Returns the repaired line and how many vertices
/// were removed.
pub fn repair_line(coords: &[Coord]) -> (Vec<Coord>, usize) {
    let mut out: Vec<Coord> = Vec::with_capacity(coords.len());
    for &c in coords {
        if !is_finite(c) {
            continue;
        }
        if out.last() == Some(&c) {
            continue;
        }
        out.push(c);
    }
    let removed = coords.len() - out.len();
    (out, removed)
}

impl BBox {
    pub fn from_points<'a, I>(points: I) -> Option<BBox>
    where
        I: IntoIterator<Item = &'a Coord>,
    {
        let mut iter = points.into_iter();
        let first = iter.next()?;
        let mut bbox = BBox {
            min_lon: first.0,
            min_lat: first.1,
            max_lon: first.0,
            max_lat: first.1,
        };
        for p in iter {
            bbox.min_lon = bbox.min_lon.min(p.0);
            bbox.min_lat = bbox.min_lat.min(p.1);
            bbox.max_lon = bbox.max_lon.max(p.0);
            bbox.max_lat = bbox.max_lat.max(p.1);
        }
        Some(bbox)
    }

    pub fn from_array(a: [f64; 4]) -> BBox {
        BBox {
            min_lon: a[0],
            min_lat: a[1],
            max_lon: a[2],
            max_lat: a[3],
        }
    }

    pub fn center(&self) -> Coord {
        (
            (self.min_lon + self.max_lon) / 2.0,
            (self.min_lat + self.max_lat) / 2.0,
        )
    }

    /// True when `other` lies entirely inside `self` (edges inclusive).
    pub fn contains(&self, other: &BBox) -> bool {
        other.min_lon >= self.min_lon
            && other.min_lat >= self.min_lat
            && other.max_lon <= self.max_lon
            && other.max_lat <= self.max_lat
    }
}

/// Grid cell key for snapping, sized so that points within `tolerance_m`
/// always land in the same or an adjacent cell.
pub fn grid_cell(c: Coord, tolerance_m: f64) -> (i64, i64) {
    let deg_lat = tolerance_m / 111_320.0;
    let lon_scale = c.1.to_radians().cos().abs().max(0.01);
    let deg_lon = deg_lat / lon_scale;
    ((c.0 / deg_lon).floor() as i64, (c.1 / deg_lat).floor() as i64)
}

/// EPSG codes whose axes are longitude/latitude degrees (WGS 84, ETRS89).
pub const GEOGRAPHIC_EPSG: [u32; 2] = [4326, 4258];

/// `EPSG:25833`, `EPSG::4326` or `urn:ogc:def:crs:EPSG::4326` → the code.
pub fn parse_epsg(text: &str) -> Option<u32> {
    let upper = text.to_uppercase();
    let at = upper.find("EPSG:")?;
    let digits: String = upper[at + 5..]
        .trim_start_matches(':')
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epsg_codes_from_names_and_urns() {
        assert_eq!(parse_epsg("EPSG:25833"), Some(25833));
        assert_eq!(parse_epsg("urn:ogc:def:crs:EPSG::4326"), Some(4326));
        assert_eq!(parse_epsg("CRS84"), None);
    }

    #[test]
    fn haversine_one_degree_latitude() {
        let d = haversine_m((10.0, 60.0), (10.0, 61.0));
        assert!((d - 111_195.0).abs() < 100.0, "got {}", d);
    }

    #[test]
    fn haversine_zero() {
        assert_eq!(haversine_m((10.0, 60.0), (10.0, 60.0)), 0.0);
    }

    #[test]
    fn empty_line_is_invalid() {
        assert!(!is_valid_line(&[]));
        assert!(!is_valid_line(&[(10.0, 60.0)]));
    }

    #[test]
    fn degenerate_line_is_invalid() {
        assert!(!is_valid_line(&[(10.0, 60.0), (10.0, 60.0)]));
        assert!(!is_valid_line(&[(f64::NAN, 60.0), (10.0, 60.1)]));
    }

    #[test]
    fn self_intersecting_closed_line_repairs_to_valid() {
        // Bow-tie ring with a doubled vertex and a NaN.
        let ring = vec![
            (10.0, 60.0),
            (10.01, 60.01),
            (10.01, 60.01),
            (10.0, 60.01),
            (f64::NAN, 60.0),
            (10.01, 60.0),
            (10.0, 60.0),
        ];
        assert!(!is_valid_line(&ring));
        let (fixed, removed) = repair_line(&ring);
        assert_eq!(removed, 2);
        assert!(is_valid_line(&fixed));
        assert_eq!(fixed.first(), fixed.last());
    }

    #[test]
    fn repair_of_empty_stays_empty() {
        let (fixed, removed) = repair_line(&[]);
        assert!(fixed.is_empty());
        assert_eq!(removed, 0);
    }

    #[test]
    fn bbox_contains_and_center() {
        let outer = BBox::from_array([4.0, 57.5, 31.5, 71.5]);
        let inner = BBox::from_points(&[(10.0, 60.0), (11.0, 61.0)]).unwrap();
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
        assert_eq!(inner.center(), (10.5, 60.5));
    }

    #[test]
    fn grid_cell_neighbours_within_tolerance() {
        let a = (10.0, 60.0);
        let b = (10.000_005, 60.000_005);
        let ca = grid_cell(a, 1.0);
        let cb = grid_cell(b, 1.0);
        assert!((ca.0 - cb.0).abs() <= 1 && (ca.1 - cb.1).abs() <= 1);
    }
}
