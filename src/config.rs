//! TOML configuration parsing and validation.
//!
//! A single immutable [`Config`] is loaded once per process and passed by
//! reference into every pipeline component. Nothing reads configuration from
//! globals or the environment after startup (except `RUST_LOG`).
//!
//! ```toml
//! [source]
//! kind = "geonorge"
//! feed_url = "https://nedlasting.geonorge.no/geonorge/ATOM-feeds/TurOgFriluftsruter_AtomFeedGEOJSON.xml"
//!
//! [store]
//! root = "./data"
//!
//! [[quality.smoke_routes]]
//! name = "preikestolen"
//! from = [6.1689, 58.9865]
//! to = [6.1903, 58.9867]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub source: SourceConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub assembly: AssemblyConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub quality: QualityConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub release: ReleaseConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub notifications: NotificationsConfig,
}

/// Where snapshots come from.
#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// `geonorge` (ATOM feed over HTTP) or `directory` (local snapshot dir).
    pub kind: String,
    #[serde(default)]
    pub feed_url: Option<String>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// Format tag that must appear in the feed entry title and link.
    #[serde(default = "default_format_tag")]
    pub format_tag: String,
    /// Suffix appended to the download URL to locate a SHA-256 sidecar.
    #[serde(default)]
    pub checksum_suffix: Option<String>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_format_tag() -> String {
    "GeoJSON".to_string()
}
fn default_source_timeout_secs() -> u64 {
    600
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetchConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: u64,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

fn default_max_retries() -> u32 {
    5
}
fn default_initial_backoff_secs() -> u64 {
    5 * 60
}
fn default_max_backoff_secs() -> u64 {
    60 * 60
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MappingConfig {
    /// Code table to use instead of the built-in Geonorge table.
    #[serde(default)]
    pub code_table: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssemblyConfig {
    /// Endpoints closer than this many metres share a node.
    #[serde(default = "default_snap_tolerance_m")]
    pub snap_tolerance_m: f64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            snap_tolerance_m: default_snap_tolerance_m(),
        }
    }
}

fn default_snap_tolerance_m() -> f64 {
    1.0
}

#[derive(Debug, Deserialize, Clone)]
pub struct BuildConfig {
    /// External routing-graph compiler, e.g. `["osrm-extract", "{input}"]`.
    /// `{input}` expands to the OSM file and `{output}` to the artifact dir.
    #[serde(default)]
    pub compiler_command: Option<Vec<String>>,
    #[serde(default = "default_walking_speed_kmh")]
    pub walking_speed_kmh: f64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            compiler_command: None,
            walking_speed_kmh: default_walking_speed_kmh(),
        }
    }
}

fn default_walking_speed_kmh() -> f64 {
    4.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct QualityConfig {
    /// Largest tolerated relative drop in edge count vs the previous release.
    #[serde(default = "default_max_edge_drop")]
    pub max_edge_drop: f64,
    /// `[min_lon, min_lat, max_lon, max_lat]` the dataset must fit inside.
    #[serde(default = "default_envelope")]
    pub envelope: [f64; 4],
    #[serde(default = "default_max_center_shift_km")]
    pub max_center_shift_km: f64,
    /// Waypoints further than this from any node do not snap.
    #[serde(default = "default_max_snap_m")]
    pub max_snap_m: f64,
    #[serde(default)]
    pub smoke_routes: Vec<SmokeRoute>,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            max_edge_drop: default_max_edge_drop(),
            envelope: default_envelope(),
            max_center_shift_km: default_max_center_shift_km(),
            max_snap_m: default_max_snap_m(),
            smoke_routes: Vec::new(),
        }
    }
}

fn default_max_edge_drop() -> f64 {
    0.20
}
fn default_envelope() -> [f64; 4] {
    [4.0, 57.5, 31.5, 71.5]
}
fn default_max_center_shift_km() -> f64 {
    50.0
}
fn default_max_snap_m() -> f64 {
    500.0
}

/// A known waypoint pair that must always be routable.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SmokeRoute {
    pub name: String,
    /// `[lon, lat]`
    pub from: [f64; 2],
    /// `[lon, lat]`
    pub to: [f64; 2],
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub root: PathBuf,
}

impl StoreConfig {
    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }
    pub fn latest_path(&self) -> PathBuf {
        self.root.join("latest.json")
    }
    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }
    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }
    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("ledger.sqlite")
    }
    pub fn lock_path(&self) -> PathBuf {
        self.root.join("run.lock")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReleaseConfig {
    /// Number of releases kept by retention.
    #[serde(default = "default_keep")]
    pub keep: usize,
}

impl Default for ReleaseConfig {
    fn default() -> Self {
        Self {
            keep: default_keep(),
        }
    }
}

fn default_keep() -> usize {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_schedule_interval_secs")]
    pub schedule_interval_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            schedule_interval_secs: default_schedule_interval_secs(),
        }
    }
}

fn default_run_timeout_secs() -> u64 {
    4 * 60 * 60
}
fn default_schedule_interval_secs() -> u64 {
    24 * 60 * 60
}

impl PipelineConfig {
    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct NotificationsConfig {
    /// Run summaries and issue events are POSTed here as JSON when set.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate source
    match config.source.kind.as_str() {
        "geonorge" => {
            if config.source.feed_url.is_none() {
                bail!("source.feed_url must be set when source.kind is 'geonorge'");
            }
        }
        "directory" => {
            if config.source.dir.is_none() {
                bail!("source.dir must be set when source.kind is 'directory'");
            }
        }
        other => bail!(
            "Unknown source kind: '{}'. Must be geonorge or directory.",
            other
        ),
    }
    if let Some(suffix) = &config.source.checksum_suffix {
        if suffix.is_empty() {
            bail!("source.checksum_suffix must not be empty when set");
        }
    }

    // Validate fetch
    if config.fetch.initial_backoff_secs == 0 {
        bail!("fetch.initial_backoff_secs must be > 0");
    }
    if config.fetch.max_backoff_secs < config.fetch.initial_backoff_secs {
        bail!("fetch.max_backoff_secs must be >= fetch.initial_backoff_secs");
    }

    // Validate assembly
    if !(config.assembly.snap_tolerance_m > 0.0) {
        bail!("assembly.snap_tolerance_m must be > 0");
    }

    // Validate build
    if !(config.build.walking_speed_kmh > 0.0) {
        bail!("build.walking_speed_kmh must be > 0");
    }
    if let Some(cmd) = &config.build.compiler_command {
        if cmd.is_empty() {
            bail!("build.compiler_command must name a program");
        }
    }

    // Validate quality
    let q = &config.quality;
    if !(0.0..=1.0).contains(&q.max_edge_drop) {
        bail!("quality.max_edge_drop must be in [0.0, 1.0]");
    }
    let [min_lon, min_lat, max_lon, max_lat] = q.envelope;
    if min_lon >= max_lon || min_lat >= max_lat {
        bail!("quality.envelope must be [min_lon, min_lat, max_lon, max_lat]");
    }
    if q.max_center_shift_km < 0.0 {
        bail!("quality.max_center_shift_km must be >= 0");
    }
    if q.smoke_routes.is_empty() {
        bail!("quality.smoke_routes must list at least one waypoint pair");
    }
    for route in &q.smoke_routes {
        for [lon, lat] in [route.from, route.to] {
            if !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat) {
                bail!(
                    "quality.smoke_routes '{}' has an out-of-range coordinate",
                    route.name
                );
            }
        }
    }

    // Validate release
    if config.release.keep == 0 {
        bail!("release.keep must be >= 1");
    }

    if config.pipeline.run_timeout_secs == 0 {
        bail!("pipeline.run_timeout_secs must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[source]
kind = "directory"
dir = "/tmp/snap"

[store]
root = "/tmp/store"

[[quality.smoke_routes]]
name = "a-b"
from = [10.0, 60.0]
to = [10.1, 60.1]
"#;

    #[test]
    fn defaults_applied() {
        let cfg = parse_config(MINIMAL).unwrap();
        assert_eq!(cfg.fetch.max_retries, 5);
        assert_eq!(cfg.fetch.initial_backoff_secs, 300);
        assert_eq!(cfg.fetch.max_backoff_secs, 3600);
        assert_eq!(cfg.quality.max_edge_drop, 0.20);
        assert_eq!(cfg.release.keep, 5);
        assert_eq!(cfg.source.format_tag, "GeoJSON");
        assert_eq!(cfg.store.releases_dir(), PathBuf::from("/tmp/store/releases"));
    }

    #[test]
    fn geonorge_requires_feed_url() {
        let text = MINIMAL.replace("kind = \"directory\"", "kind = \"geonorge\"");
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("feed_url"));
    }

    #[test]
    fn unknown_source_kind_rejected() {
        let text = MINIMAL.replace("kind = \"directory\"", "kind = \"ftp\"");
        assert!(parse_config(&text).is_err());
    }

    #[test]
    fn smoke_routes_required() {
        let text = MINIMAL.split("[[quality.smoke_routes]]").next().unwrap();
        let err = parse_config(text).unwrap_err();
        assert!(err.to_string().contains("smoke_routes"));
    }

    #[test]
    fn inverted_envelope_rejected() {
        let text = MINIMAL.replace(
            "[store]",
            "[quality]\nenvelope = [30.0, 57.0, 4.0, 71.0]\n\n[store]",
        );
        let err = parse_config(&text).unwrap_err();
        assert!(err.to_string().contains("envelope"));
    }

    #[test]
    fn zero_keep_rejected() {
        let text = format!("{}\n[release]\nkeep = 0\n", MINIMAL);
        assert!(parse_config(&text).is_err());
    }
}
