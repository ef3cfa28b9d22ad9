//! Attribute mapping and inference.
//!
//! Turns a [`TrailSegment`]'s raw, sparsely populated attributes into a
//! [`CanonicalEdge`]. Mapping never fails: unrecognised codes become an
//! explicit `Unspecified` value.
//!
//! | Tier | Fields | Policy |
//! |------|--------|--------|
//! | 1 | activity, route-follows, marking, name, reference | always mapped |
//! | 2 | difficulty, surface | authoritative when present, else inferred from route-follows |
//! | 3 | season, lighting, signposting, width, traffic | only when present |
//! | 4 | maintainer, accuracy, update date | confidence score, never tags |

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::codes::{CodeTable, Inference};
use crate::models::{
    Activity, Attributed, CanonicalEdge, Conditional, Difficulty, Marking, Provenance, Surface,
    TrailSegment, WayType,
};

const ACCURACY_UNKNOWN: f64 = 0.5;
const RECENCY_UNKNOWN: f64 = 0.3;
/// Positional error at which the accuracy component reaches zero.
const ACCURACY_ZERO_AT_M: f64 = 50.0;
/// Age at which the recency component reaches zero.
const RECENCY_ZERO_AT_YEARS: f64 = 10.0;

/// Maps segments against one code table as of a fixed reference time.
///
/// The reference time (normally the snapshot's fetch time) is what recency
/// is measured against, so mapping the same segment twice is identical.
pub struct Mapper {
    table: CodeTable,
    as_of: DateTime<Utc>,
}

impl Mapper {
    pub fn new(table: CodeTable, as_of: DateTime<Utc>) -> Self {
        Self { table, as_of }
    }

    pub fn table(&self) -> &CodeTable {
        &self.table
    }

    pub fn map(&self, segment: &TrailSegment) -> CanonicalEdge {
        let fields = &self.table.fields;

        let activity = segment
            .attr(&fields.activity)
            .and_then(|code| self.table.activity.get(code).copied())
            .unwrap_or(Activity::Unspecified);

        let follows_code = segment.attr(&fields.follows);
        let rule = follows_code.and_then(|code| self.table.follows.get(code));
        let way = rule.map(|r| r.way).unwrap_or(WayType::Unspecified);
        let follows = match (follows_code, rule) {
            (_, Some(r)) => Some(r.class.clone()),
            (Some(_), None) => Some("unspecified".to_string()),
            (None, None) => None,
        };

        let marking = segment
            .attr(&fields.marking)
            .map(|code| {
                self.table
                    .marking
                    .get(code)
                    .copied()
                    .unwrap_or(Marking::Unspecified)
            })
            .unwrap_or(Marking::Unspecified);

        let difficulty = tier_two(
            segment.attr(&fields.difficulty),
            |code| self.table.difficulty.get(code).copied(),
            rule.and_then(|r| r.difficulty),
            &fields.follows,
            Difficulty::Unspecified,
        );
        let surface = tier_two(
            segment.attr(&fields.surface),
            |code| self.table.surface.get(code).copied(),
            rule.and_then(|r| r.surface),
            &fields.follows,
            Surface::Unspecified,
        );

        CanonicalEdge {
            segment_id: segment.segment_id.clone(),
            activity,
            way,
            follows,
            marking,
            name: text(segment.attr(&fields.name)),
            reference: text(segment.attr(&fields.reference)),
            difficulty,
            surface,
            conditional: self.conditional(segment),
            maintainer: fields
                .maintainer
                .as_deref()
                .and_then(|f| text(segment.attr(f))),
            confidence: self.confidence(segment),
        }
    }

    fn conditional(&self, segment: &TrailSegment) -> Conditional {
        let fields = &self.table.fields;
        let raw = |field: &Option<String>| field.as_deref().and_then(|f| segment.attr(f));

        Conditional {
            season: raw(&fields.season).map(|code| {
                self.table
                    .season
                    .get(code)
                    .copied()
                    .unwrap_or(crate::models::Season::Unspecified)
            }),
            lit: raw(&fields.lit).and_then(|code| self.table.yes_no.get(code).copied()),
            signposted: raw(&fields.signposted)
                .and_then(|code| self.table.yes_no.get(code).copied()),
            width_class: raw(&fields.width).map(|code| {
                self.table
                    .width
                    .get(code)
                    .cloned()
                    .unwrap_or_else(|| "unspecified".to_string())
            }),
            traffic_class: raw(&fields.traffic).map(|code| {
                self.table
                    .traffic
                    .get(code)
                    .cloned()
                    .unwrap_or_else(|| "unspecified".to_string())
            }),
        }
    }

    /// `0.5·accuracy + 0.3·recency + 0.2·maintainer`, rounded to 3 decimals.
    fn confidence(&self, segment: &TrailSegment) -> f64 {
        let fields = &self.table.fields;

        let accuracy = fields
            .accuracy_m
            .as_deref()
            .and_then(|f| segment.attr(f))
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|m| m.is_finite() && *m >= 0.0)
            .map(|m| (1.0 - m / ACCURACY_ZERO_AT_M).clamp(0.0, 1.0))
            .or_else(|| {
                fields
                    .measurement_method
                    .as_deref()
                    .and_then(|f| segment.attr(f))
                    .and_then(|code| self.table.method_accuracy(code))
            })
            .unwrap_or(ACCURACY_UNKNOWN);

        let recency = fields
            .updated
            .iter()
            .find_map(|f| segment.attr(f).and_then(parse_date))
            .map(|date| {
                let age_days = (self.as_of - date).num_days() as f64;
                (1.0 - age_days / 365.25 / RECENCY_ZERO_AT_YEARS).clamp(0.0, 1.0)
            })
            .unwrap_or(RECENCY_UNKNOWN);

        let maintainer = match fields
            .maintainer
            .as_deref()
            .and_then(|f| text(segment.attr(f)))
        {
            Some(_) => 1.0,
            None => 0.0,
        };

        let score = 0.5 * accuracy + 0.3 * recency + 0.2 * maintainer;
        (score * 1000.0).round() / 1000.0
    }
}

/// Resolve a tier-2 attribute: the authoritative code when recognised,
/// otherwise the route-follows inference rule, otherwise `unspecified`.
fn tier_two<T: Copy>(
    raw: Option<&str>,
    lookup: impl Fn(&str) -> Option<T>,
    rule: Option<Inference<T>>,
    inferred_from: &str,
    unspecified: T,
) -> Attributed<T> {
    if let Some(value) = raw.and_then(&lookup) {
        return Attributed {
            value,
            provenance: Provenance::Authoritative,
            confidence: 1.0,
        };
    }
    if let Some(code) = raw {
        tracing::debug!(code, "unrecognised tier-2 code, falling back to inference");
    }
    match rule {
        Some(rule) => Attributed {
            value: rule.value,
            provenance: Provenance::Inferred {
                from: inferred_from.to_string(),
            },
            confidence: rule.confidence,
        },
        None => Attributed {
            value: unspecified,
            provenance: Provenance::Absent,
            confidence: 0.0,
        },
    }
}

fn text(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts RFC 3339, `YYYY-MM-DDTHH:MM:SS`, and `YYYY-MM-DD`.
pub(crate) fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S") {
        return Some(dt.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}
