//! Release store.
//!
//! Releases are immutable directories under `releases/`, named with a
//! sortable id. A release becomes visible in two atomic steps: its staging
//! directory is renamed into place, then `latest.json` is replaced via
//! write-temp-and-rename. A failure before the first rename leaves only a
//! staging directory, which the next publish removes. Every file is synced
//! before its rename and every directory after, so a power loss cannot
//! leave `latest.json` naming a release with missing contents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::build::BuiltArtifact;
use crate::config::StoreConfig;
use crate::models::{BBox, NetworkGraph, SourceSnapshot};
use crate::quality::QualityReport;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const REPORT_FILE: &str = "quality-report.json";
const STAGING_PREFIX: &str = ".staging-";
const MAX_VERSION_CHARS: usize = 64;

#[derive(Debug)]
pub enum ReleaseError {
    Io { path: PathBuf, message: String },
    Corrupt { path: PathBuf, message: String },
    AlreadyExists(String),
}

impl std::fmt::Display for ReleaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReleaseError::Io { path, message } => {
                write!(f, "release store I/O error at {}: {}", path.display(), message)
            }
            ReleaseError::Corrupt { path, message } => {
                write!(f, "unreadable release metadata {}: {}", path.display(), message)
            }
            ReleaseError::AlreadyExists(id) => write!(f, "release {} already exists", id),
        }
    }
}

impl std::error::Error for ReleaseError {}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> ReleaseError + '_ {
    move |e| ReleaseError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub release_id: String,
    pub source_version: String,
    pub source_url: String,
    pub built_at: DateTime<Utc>,
    /// The release this one replaced as latest.
    pub supersedes: Option<String>,
    pub edge_count: usize,
    pub node_count: usize,
    pub bbox: Option<BBox>,
    /// Relative path → hex SHA-256, for every file except the manifest.
    pub files: BTreeMap<String, String>,
}

/// Contents of `latest.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestPointer {
    pub release_id: String,
    pub source_version: String,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Release {
    pub id: String,
    pub dir: PathBuf,
    pub manifest: ReleaseManifest,
}

pub struct ReleaseStore {
    releases: PathBuf,
    latest: PathBuf,
}

impl ReleaseStore {
    pub fn new(store: &StoreConfig) -> Self {
        Self {
            releases: store.releases_dir(),
            latest: store.latest_path(),
        }
    }

    pub fn release_dir(&self, id: &str) -> PathBuf {
        self.releases.join(id)
    }

    pub fn latest_pointer(&self) -> Result<Option<LatestPointer>, ReleaseError> {
        if !self.latest.exists() {
            return Ok(None);
        }
        read_json(&self.latest).map(Some)
    }

    /// Manifest of the current release, if any.
    pub fn latest(&self) -> Result<Option<ReleaseManifest>, ReleaseError> {
        match self.latest_pointer()? {
            Some(p) => self.manifest(&p.release_id).map(Some),
            None => Ok(None),
        }
    }

    pub fn manifest(&self, id: &str) -> Result<ReleaseManifest, ReleaseError> {
        read_json(&self.release_dir(id).join(MANIFEST_FILE))
    }

    /// Published release ids, oldest first. Staging directories are skipped.
    pub fn list_ids(&self) -> Result<Vec<String>, ReleaseError> {
        if !self.releases.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.releases).map_err(io_at(&self.releases))? {
            let entry = entry.map_err(io_at(&self.releases))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.path().join(MANIFEST_FILE).is_file() {
                continue;
            }
            ids.push(name);
        }
        ids.sort();
        Ok(ids)
    }

    pub fn publish(
        &self,
        artifact: &BuiltArtifact,
        report: &QualityReport,
        graph: &NetworkGraph,
        snapshot: &SourceSnapshot,
        built_at: DateTime<Utc>,
    ) -> Result<Release, ReleaseError> {
        std::fs::create_dir_all(&self.releases).map_err(io_at(&self.releases))?;
        self.remove_stale_staging()?;

        let id = release_id(built_at, &snapshot.version);
        let final_dir = self.release_dir(&id);
        if final_dir.exists() {
            return Err(ReleaseError::AlreadyExists(id));
        }
        let supersedes = self.latest_pointer()?.map(|p| p.release_id);

        let staging = self.releases.join(format!("{}{}", STAGING_PREFIX, id));
        std::fs::create_dir_all(&staging).map_err(io_at(&staging))?;

        let mut files = BTreeMap::new();
        for rel in &artifact.files {
            let src = artifact.dir.join(rel);
            let dst = staging.join(rel);
            if let Some(parent) = dst.parent() {
                std::fs::create_dir_all(parent).map_err(io_at(parent))?;
            }
            let bytes = std::fs::read(&src).map_err(io_at(&src))?;
            write_synced(&dst, &bytes)?;
            files.insert(rel.clone(), sha256_hex(&bytes));
        }

        let report_bytes = to_json(report, &staging)?;
        let report_path = staging.join(REPORT_FILE);
        write_synced(&report_path, &report_bytes)?;
        files.insert(REPORT_FILE.to_string(), sha256_hex(&report_bytes));

        let manifest = ReleaseManifest {
            release_id: id.clone(),
            source_version: snapshot.version.clone(),
            source_url: snapshot.source_url.clone(),
            built_at,
            supersedes,
            edge_count: graph.edge_count(),
            node_count: graph.node_count(),
            bbox: graph.bbox,
            files,
        };
        let manifest_path = staging.join(MANIFEST_FILE);
        write_synced(&manifest_path, &to_json(&manifest, &staging)?)?;
        for dir in artifact_dirs(&staging, &artifact.files) {
            sync_dir(&dir)?;
        }

        std::fs::rename(&staging, &final_dir).map_err(io_at(&final_dir))?;
        sync_dir(&self.releases)?;

        let pointer = LatestPointer {
            release_id: id.clone(),
            source_version: snapshot.version.clone(),
            published_at: Utc::now(),
        };
        write_atomic(&self.latest, &to_json(&pointer, &self.latest)?)?;

        tracing::info!(release = %id, version = %snapshot.version, "release published");
        Ok(Release {
            id,
            dir: final_dir,
            manifest,
        })
    }

    /// Delete all but the newest `keep` releases. The release `latest.json`
    /// points to is never deleted. Returns removed ids, oldest first.
    pub fn retain(&self, keep: usize) -> Result<Vec<String>, ReleaseError> {
        let ids = self.list_ids()?;
        let current = self.latest_pointer()?.map(|p| p.release_id);
        let cutoff = ids.len().saturating_sub(keep);

        let mut removed = Vec::new();
        for id in &ids[..cutoff] {
            if current.as_deref() == Some(id.as_str()) {
                continue;
            }
            let dir = self.release_dir(id);
            std::fs::remove_dir_all(&dir).map_err(io_at(&dir))?;
            tracing::info!(release = %id, "release removed by retention");
            removed.push(id.clone());
        }
        Ok(removed)
    }

    /// Re-hash a release's files. Returns paths whose digest does not match
    /// the manifest (missing files included).
    pub fn verify(&self, id: &str) -> Result<Vec<String>, ReleaseError> {
        let manifest = self.manifest(id)?;
        let dir = self.release_dir(id);
        let mut mismatched = Vec::new();
        for (rel, expected) in &manifest.files {
            match std::fs::read(dir.join(rel)) {
                Ok(bytes) if sha256_hex(&bytes) == *expected => {}
                _ => mismatched.push(rel.clone()),
            }
        }
        Ok(mismatched)
    }

    fn remove_stale_staging(&self) -> Result<(), ReleaseError> {
        for entry in std::fs::read_dir(&self.releases).map_err(io_at(&self.releases))? {
            let entry = entry.map_err(io_at(&self.releases))?;
            if entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                let path = entry.path();
                tracing::warn!(path = %path.display(), "removing stale staging directory");
                std::fs::remove_dir_all(&path).map_err(io_at(&path))?;
            }
        }
        Ok(())
    }
}

/// `YYYYMMDDTHHMMSSZ-<version>`, with the version reduced to `[A-Za-z0-9._-]`.
pub fn release_id(built_at: DateTime<Utc>, version: &str) -> String {
    let mut clean: String = version
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_VERSION_CHARS)
        .collect();
    if clean.is_empty() {
        clean.push_str("unversioned");
    }
    format!("{}-{}", built_at.format("%Y%m%dT%H%M%SZ"), clean)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn to_json<T: Serialize>(value: &T, path: &Path) -> Result<Vec<u8>, ReleaseError> {
    serde_json::to_vec_pretty(value).map_err(|e| ReleaseError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ReleaseError> {
    let bytes = std::fs::read(path).map_err(io_at(path))?;
    serde_json::from_slice(&bytes).map_err(|e| ReleaseError::Corrupt {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Replace `path` by writing a sibling temp file, syncing it, and renaming
/// it over. The parent directory is synced so the rename itself is durable.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ReleaseError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    write_synced(&tmp, bytes)?;
    std::fs::rename(&tmp, path).map_err(io_at(path))?;
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => sync_dir(parent),
        _ => Ok(()),
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), ReleaseError> {
    let mut file = File::create(path).map_err(io_at(path))?;
    file.write_all(bytes).map_err(io_at(path))?;
    file.sync_all().map_err(io_at(path))
}

/// The staging root and every subdirectory holding artifact files.
fn artifact_dirs(staging: &Path, files: &[String]) -> BTreeSet<PathBuf> {
    let mut dirs = BTreeSet::new();
    dirs.insert(staging.to_path_buf());
    for rel in files {
        let mut at = staging.join(rel);
        while at.pop() && at.starts_with(staging) && at != staging {
            dirs.insert(at.clone());
        }
    }
    dirs
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), ReleaseError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(io_at(dir))
}

// Directory handles cannot be synced on this platform.
#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), ReleaseError> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::compile;
    use crate::models::NetworkNode;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        store: ReleaseStore,
        artifact: BuiltArtifact,
        graph: NetworkGraph,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let artifact_dir = tmp.path().join("work");
        std::fs::create_dir_all(artifact_dir.join("osrm")).unwrap();
        std::fs::write(artifact_dir.join("network.osm"), b"<osm/>").unwrap();
        std::fs::write(artifact_dir.join("osrm/network.osrm"), b"binary").unwrap();
        let graph = NetworkGraph {
            edges: Vec::new(),
            nodes: vec![NetworkNode {
                id: 0,
                coord: (10.0, 60.0),
            }],
            trails: BTreeMap::new(),
            repairs: Vec::new(),
            bbox: Some(BBox::from_array([10.0, 60.0, 10.0, 60.0])),
        };
        let artifact = BuiltArtifact {
            dir: artifact_dir,
            files: vec!["network.osm".to_string(), "osrm/network.osrm".to_string()],
            graph: compile(&graph, 4.5),
        };
        let store = ReleaseStore::new(&StoreConfig {
            root: tmp.path().join("store"),
        });
        Fixture {
            _tmp: tmp,
            store,
            artifact,
            graph,
        }
    }

    fn report(version: &str) -> QualityReport {
        QualityReport {
            run_id: "run".to_string(),
            source_version: version.to_string(),
            generated_at: Utc::now(),
            passed: true,
            checks: Vec::new(),
        }
    }

    fn snapshot(version: &str) -> SourceSnapshot {
        SourceSnapshot {
            payload: Vec::new(),
            version: version.to_string(),
            checksum: None,
            source_url: "file:///snap".to_string(),
            fetched_at: Utc::now(),
        }
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 12, 0, 0).unwrap()
    }

    fn publish(f: &Fixture, version: &str, day: u32) -> Release {
        f.store
            .publish(&f.artifact, &report(version), &f.graph, &snapshot(version), at(day))
            .unwrap()
    }

    #[test]
    fn release_ids_sort_chronologically() {
        assert_eq!(
            release_id(at(1), "2025-03-01T00:00:00Z"),
            "20250301T120000Z-2025-03-01T00_00_00Z"
        );
        assert!(release_id(at(1), "zzz") < release_id(at(2), "aaa"));
        assert!(release_id(at(1), "").ends_with("-unversioned"));
    }

    #[test]
    fn publish_writes_bundle_and_latest() {
        let f = fixture();
        let release = publish(&f, "v1", 1);

        for file in ["network.osm", "osrm/network.osrm", REPORT_FILE, MANIFEST_FILE] {
            assert!(release.dir.join(file).is_file(), "{} missing", file);
        }
        assert_eq!(release.manifest.files.len(), 3);
        assert_eq!(release.manifest.files["network.osm"], sha256_hex(b"<osm/>"));
        assert_eq!(f.store.latest().unwrap().unwrap(), release.manifest);
        assert!(f.store.verify(&release.id).unwrap().is_empty());
    }

    #[test]
    fn second_publish_supersedes_first() {
        let f = fixture();
        let first = publish(&f, "v1", 1);
        let second = publish(&f, "v2", 2);
        assert_eq!(second.manifest.supersedes.as_deref(), Some(first.id.as_str()));
        assert_eq!(f.store.list_ids().unwrap(), vec![first.id, second.id.clone()]);
        assert_eq!(f.store.latest_pointer().unwrap().unwrap().release_id, second.id);
    }

    #[test]
    fn failed_publish_leaves_latest_untouched() {
        let f = fixture();
        let first = publish(&f, "v1", 1);
        let mut broken = f.artifact.clone();
        broken.files.push("missing.bin".to_string());
        let err = f
            .store
            .publish(&broken, &report("v2"), &f.graph, &snapshot("v2"), at(2))
            .unwrap_err();
        assert!(matches!(err, ReleaseError::Io { .. }));
        assert_eq!(f.store.latest_pointer().unwrap().unwrap().release_id, first.id);
        assert_eq!(f.store.list_ids().unwrap(), vec![first.id]);

        // The next publish sweeps the leftover staging directory.
        publish(&f, "v3", 3);
        let leftovers = std::fs::read_dir(f.store.releases.clone())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn duplicate_release_id_rejected() {
        let f = fixture();
        publish(&f, "v1", 1);
        let err = f
            .store
            .publish(&f.artifact, &report("v1"), &f.graph, &snapshot("v1"), at(1))
            .unwrap_err();
        assert!(matches!(err, ReleaseError::AlreadyExists(_)));
    }

    #[test]
    fn retention_keeps_newest_and_latest() {
        let f = fixture();
        let ids: Vec<String> = (1..=4).map(|d| publish(&f, &format!("v{}", d), d).id).collect();
        let removed = f.store.retain(2).unwrap();
        assert_eq!(removed, ids[..2].to_vec());
        assert_eq!(f.store.list_ids().unwrap(), ids[2..].to_vec());
    }

    #[test]
    fn retention_never_removes_latest_target() {
        let f = fixture();
        let ids: Vec<String> = (1..=3).map(|d| publish(&f, &format!("v{}", d), d).id).collect();
        // Point latest back at the oldest release, as after a manual rollback.
        let pointer = LatestPointer {
            release_id: ids[0].clone(),
            source_version: "v1".to_string(),
            published_at: Utc::now(),
        };
        write_atomic(
            &f.store.latest,
            &serde_json::to_vec(&pointer).unwrap(),
        )
        .unwrap();

        let removed = f.store.retain(1).unwrap();
        assert_eq!(removed, vec![ids[1].clone()]);
        assert_eq!(f.store.list_ids().unwrap(), vec![ids[0].clone(), ids[2].clone()]);
    }

    #[test]
    fn verify_detects_tampering() {
        let f = fixture();
        let release = publish(&f, "v1", 1);
        std::fs::write(release.dir.join("network.osm"), b"<osm>changed</osm>").unwrap();
        assert_eq!(f.store.verify(&release.id).unwrap(), vec!["network.osm".to_string()]);
    }

    #[test]
    fn empty_store_has_no_latest() {
        let f = fixture();
        assert!(f.store.latest().unwrap().is_none());
        assert!(f.store.list_ids().unwrap().is_empty());
        assert!(f.store.retain(1).unwrap().is_empty());
    }

    #[test]
    fn atomic_write_replaces_without_leftovers() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("latest.json");
        write_atomic(&path, b"{\"a\":1}").unwrap();
        write_atomic(&path, b"{\"a\":2}").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"a\":2}");
        let names: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["latest.json".to_string()]);
    }

    #[test]
    fn nested_artifact_directories_are_synced() {
        let staging = Path::new("/store/releases/.staging-x");
        let dirs = artifact_dirs(
            staging,
            &["network.osm".to_string(), "tiles/7/a.pbf".to_string()],
        );
        let expected: BTreeSet<PathBuf> = [
            staging.to_path_buf(),
            staging.join("tiles"),
            staging.join("tiles/7"),
        ]
        .into_iter()
        .collect();
        assert_eq!(dirs, expected);
    }
}
