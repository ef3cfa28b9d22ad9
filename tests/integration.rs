use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use trailforge::lock::RunLock;

fn trailforge_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("trailforge");
    path
}

const SNAPSHOT: &str = r#"{
  "type": "FeatureCollection",
  "features": [
    {
      "type": "Feature",
      "geometry": { "type": "LineString", "coordinates": [[6.1689, 58.9865], [6.1750, 58.9866]] },
      "properties": { "lokalid": "seg-1", "rutenummer": "T1", "objtype": "Fotrute", "rutefolger": "ST", "gradering": "B" }
    },
    {
      "type": "Feature",
      "geometry": { "type": "LineString", "coordinates": [[6.1750, 58.9866], [6.1810, 58.9867]] },
      "properties": { "lokalid": "seg-2", "rutenummer": "T1", "objtype": "Fotrute", "rutefolger": "ST" }
    },
    {
      "type": "Feature",
      "geometry": { "type": "LineString", "coordinates": [[6.1810, 58.9867], [6.1903, 58.9867]] },
      "properties": { "lokalid": "seg-3", "rutenummer": "T1", "objtype": "Fotrute", "rutefolger": "ST", "gradering": "R" }
    },
    {
      "type": "Feature",
      "geometry": { "type": "Point", "coordinates": [6.1903, 58.9867] },
      "properties": { "lokalid": "poi-1" }
    }
  ]
}"#;

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let snapshot_dir = root.join("snapshot");
    fs::create_dir_all(&snapshot_dir).unwrap();
    fs::write(snapshot_dir.join("snapshot.geojson"), SNAPSHOT).unwrap();
    fs::write(snapshot_dir.join("VERSION"), "2024-05-01T00:00:00Z\n").unwrap();

    let config_content = format!(
        r#"[source]
kind = "directory"
dir = "{root}/snapshot"

[store]
root = "{root}/store"

[release]
keep = 2

[[quality.smoke_routes]]
name = "preikestolen"
from = [6.1689, 58.9865]
to = [6.1903, 58.9867]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("trailforge.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_trailforge(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = trailforge_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run trailforge binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

#[test]
fn test_init_creates_store() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_trailforge(&config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("store/ledger.sqlite").is_file());
    assert!(tmp.path().join("store/releases").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_trailforge(&config_path, &["init"]);
    assert_eq!(first, Some(0), "First init failed");

    let (_, _, second) = run_trailforge(&config_path, &["init"]);
    assert_eq!(second, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_run_releases_then_skips() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, code) = run_trailforge(&config_path, &["run"]);
    assert_eq!(code, Some(0), "run failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("released"));
    assert!(stdout.contains("3 edges"));
    assert!(tmp.path().join("store/latest.json").is_file());

    let (stdout, _, code) = run_trailforge(&config_path, &["run"]);
    assert_eq!(code, Some(3));
    assert!(stdout.contains("skipped"));
}

#[test]
fn test_check_exit_codes() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, code) = run_trailforge(&config_path, &["check"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("update available"));

    run_trailforge(&config_path, &["run"]);
    let (_, _, code) = run_trailforge(&config_path, &["check"]);
    assert_eq!(code, Some(3));
}

#[test]
fn test_failed_run_names_component() {
    let (tmp, config_path) = setup_test_env();
    fs::write(
        tmp.path().join("snapshot/snapshot.geojson"),
        SNAPSHOT.replace("\"seg-3\"", "\"seg-1\""),
    )
    .unwrap();

    let (stdout, _, code) = run_trailforge(&config_path, &["run"]);
    assert_eq!(code, Some(1));
    assert!(stdout.contains("failed at assembling in assembler"), "{}", stdout);
    assert!(stdout.contains("seg-1"));
    assert!(!tmp.path().join("store/latest.json").exists());

    let (stdout, _, code) = run_trailforge(&config_path, &["history"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("Open issue #1"));
}

#[test]
fn test_releases_and_inspect() {
    let (tmp, config_path) = setup_test_env();
    run_trailforge(&config_path, &["run"]);

    let (stdout, stderr, code) = run_trailforge(&config_path, &["releases"]);
    assert_eq!(code, Some(0), "releases failed: {}", stderr);
    assert!(stdout.contains("2024-05-01T00:00:00Z"));
    assert!(stdout.contains("*"));

    let (stdout, stderr, code) = run_trailforge(&config_path, &["inspect"]);
    assert_eq!(code, Some(0), "inspect failed: {}", stderr);
    assert!(stdout.contains("Edges:          3"));
    assert!(stdout.contains("routing_smoke_test"));
    assert!(stdout.contains("verified"));

    // Tamper with a published file.
    let latest = fs::read_to_string(tmp.path().join("store/latest.json")).unwrap();
    let pointer: serde_json::Value = serde_json::from_str(&latest).unwrap();
    let id = pointer["release_id"].as_str().unwrap();
    fs::write(
        tmp.path().join("store/releases").join(id).join("network.osm"),
        "<osm/>",
    )
    .unwrap();
    let (stdout, _, code) = run_trailforge(&config_path, &["inspect", id]);
    assert_eq!(code, Some(1));
    assert!(stdout.contains("network.osm"));
}

#[test]
fn test_inspect_without_release_errors() {
    let (_tmp, config_path) = setup_test_env();
    let (_, stderr, code) = run_trailforge(&config_path, &["inspect"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("No release"));
}

#[test]
fn test_missing_config_errors() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, code) = run_trailforge(&tmp.path().join("nope.toml"), &["run"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_run_refused_while_locked() {
    let (tmp, config_path) = setup_test_env();
    fs::create_dir_all(tmp.path().join("store")).unwrap();
    let lock_path = tmp.path().join("store/run.lock");
    let holder = RunLock::acquire(&lock_path, "held-by-test").unwrap();

    let (_, stderr, code) = run_trailforge(&config_path, &["run"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("another run holds the release store"));
    assert!(stderr.contains("held-by-test"), "{}", stderr);

    drop(holder);
    let (_, _, code) = run_trailforge(&config_path, &["run"]);
    assert_eq!(code, Some(0));
}

#[test]
fn test_stale_lock_file_does_not_block_run() {
    let (tmp, config_path) = setup_test_env();
    fs::create_dir_all(tmp.path().join("store")).unwrap();
    fs::write(tmp.path().join("store/run.lock"), "1\n").unwrap();

    let (stdout, stderr, code) = run_trailforge(&config_path, &["run"]);
    assert_eq!(code, Some(0), "stdout={} stderr={}", stdout, stderr);
}
