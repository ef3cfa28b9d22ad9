//! Per-source code tables.
//!
//! A code table maps one provider's raw attribute names and enumerated codes
//! onto the canonical tag set, and carries the inference rules used when a
//! tier-2 field is missing. Tables are TOML data; supporting another country
//! means writing another table, not touching the mapper.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::models::{Activity, Difficulty, Marking, Season, Surface, WayType};

const BUILTIN_GEONORGE: &str = include_str!("../data/no-geonorge.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct CodeTable {
    pub source: TableSource,
    pub fields: FieldNames,
    pub activity: BTreeMap<String, Activity>,
    pub follows: BTreeMap<String, FollowsRule>,
    pub difficulty: BTreeMap<String, Difficulty>,
    pub surface: BTreeMap<String, Surface>,
    pub marking: BTreeMap<String, Marking>,
    #[serde(default)]
    pub season: BTreeMap<String, Season>,
    #[serde(default)]
    pub yes_no: BTreeMap<String, bool>,
    #[serde(default)]
    pub width: BTreeMap<String, String>,
    #[serde(default)]
    pub traffic: BTreeMap<String, String>,
    #[serde(default)]
    pub method_accuracy: BTreeMap<String, f64>,
    /// Raw attribute name → English name, for reports.
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TableSource {
    pub id: String,
    pub name: String,
}

/// Raw attribute names for each canonical concept.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldNames {
    pub segment_id: String,
    pub trail_number: String,
    pub activity: String,
    pub follows: String,
    pub marking: String,
    pub name: String,
    pub reference: String,
    pub difficulty: String,
    pub surface: String,
    pub season: Option<String>,
    pub lit: Option<String>,
    pub signposted: Option<String>,
    pub width: Option<String>,
    pub traffic: Option<String>,
    pub maintainer: Option<String>,
    pub accuracy_m: Option<String>,
    pub measurement_method: Option<String>,
    /// Date fields tried in order for recency.
    #[serde(default)]
    pub updated: Vec<String>,
}

/// One route-follows code: its canonical class plus inference rules.
#[derive(Debug, Clone, Deserialize)]
pub struct FollowsRule {
    pub class: String,
    pub way: WayType,
    #[serde(default)]
    pub surface: Option<Inference<Surface>>,
    #[serde(default)]
    pub difficulty: Option<Inference<Difficulty>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Inference<T> {
    pub value: T,
    pub confidence: f64,
}

impl CodeTable {
    /// The built-in table for Geonorge's Turrutebasen.
    pub fn geonorge() -> Result<CodeTable> {
        parse_table(BUILTIN_GEONORGE).context("built-in Geonorge code table is invalid")
    }

    /// English name of a raw attribute; untranslated names pass through.
    pub fn english_column<'a>(&'a self, raw: &'a str) -> &'a str {
        self.columns.get(raw).map(String::as_str).unwrap_or(raw)
    }

    /// Accuracy score for a measurement-method code: exact code first, then
    /// its leading digit class.
    pub fn method_accuracy(&self, code: &str) -> Option<f64> {
        if let Some(score) = self.method_accuracy.get(code) {
            return Some(*score);
        }
        let class = code.get(..1)?;
        self.method_accuracy.get(class).copied()
    }
}

/// Load the configured table, or the built-in one when `path` is `None`.
pub fn load_code_table(path: Option<&Path>) -> Result<CodeTable> {
    match path {
        Some(p) => {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("Failed to read code table: {}", p.display()))?;
            parse_table(&content).with_context(|| format!("Invalid code table: {}", p.display()))
        }
        None => CodeTable::geonorge(),
    }
}

pub fn parse_table(content: &str) -> Result<CodeTable> {
    let table: CodeTable = toml::from_str(content)?;

    for (code, rule) in &table.follows {
        let confidences = rule
            .surface
            .iter()
            .map(|i| i.confidence)
            .chain(rule.difficulty.iter().map(|i| i.confidence));
        for c in confidences {
            if !(0.0..=1.0).contains(&c) {
                bail!("follows.{}: inference confidence {} not in [0, 1]", code, c);
            }
        }
    }
    for (code, score) in &table.method_accuracy {
        if !(0.0..=1.0).contains(score) {
            bail!("method_accuracy.{}: score {} not in [0, 1]", code, score);
        }
    }

    Ok(table)
}
