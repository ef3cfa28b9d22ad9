//! Read-only views of the release store and run ledger.
//!
//! Backs `trailforge releases`, `trailforge inspect` and
//! `trailforge history`. Nothing here mutates the store.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::quality::QualityReport;
use crate::release::{ReleaseStore, REPORT_FILE};

/// List published releases, newest first, marking the current one.
pub fn run_releases(config: &Config) -> Result<()> {
    let store = ReleaseStore::new(&config.store);
    let current = store.latest_pointer()?.map(|p| p.release_id);
    let ids = store.list_ids()?;

    if ids.is_empty() {
        println!("No releases in {}", config.store.releases_dir().display());
        return Ok(());
    }

    println!(
        "  {:<2}{:<40} {:>8} {:>8}   {}",
        "", "RELEASE", "EDGES", "NODES", "SOURCE VERSION"
    );
    println!("  {}", "-".repeat(84));
    for id in ids.iter().rev() {
        let marker = if current.as_deref() == Some(id.as_str()) {
            "*"
        } else {
            ""
        };
        match store.manifest(id) {
            Ok(m) => println!(
                "  {:<2}{:<40} {:>8} {:>8}   {}",
                marker, id, m.edge_count, m.node_count, m.source_version
            ),
            Err(e) => println!("  {:<2}{:<40} (unreadable: {})", marker, id, e),
        }
    }
    Ok(())
}

/// Show one release (default: the current one): manifest, quality checks,
/// and whether every file still matches its recorded digest.
pub fn run_inspect(config: &Config, id: Option<&str>) -> Result<()> {
    let store = ReleaseStore::new(&config.store);
    let id = match id {
        Some(id) => id.to_string(),
        None => match store.latest_pointer()? {
            Some(pointer) => pointer.release_id,
            None => bail!("No release has been published yet"),
        },
    };

    let manifest = store.manifest(&id)?;
    let report_path = store.release_dir(&id).join(REPORT_FILE);
    let report: QualityReport = serde_json::from_slice(
        &std::fs::read(&report_path)
            .with_context(|| format!("Failed to read {}", report_path.display()))?,
    )
    .with_context(|| format!("Failed to parse {}", report_path.display()))?;

    println!("Release {}", manifest.release_id);
    println!("  Source version: {}", manifest.source_version);
    println!("  Source URL:     {}", manifest.source_url);
    println!("  Built at:       {}", format_ts(manifest.built_at));
    println!(
        "  Supersedes:     {}",
        manifest.supersedes.as_deref().unwrap_or("-")
    );
    println!("  Edges:          {}", manifest.edge_count);
    println!("  Nodes:          {}", manifest.node_count);
    if let Some(b) = manifest.bbox {
        println!(
            "  BBox:           [{:.4}, {:.4}, {:.4}, {:.4}]",
            b.min_lon, b.min_lat, b.max_lon, b.max_lat
        );
    }

    println!();
    println!("  Quality checks (run {}):", report.run_id);
    for check in &report.checks {
        let mut line = format!(
            "    {:<4} {:<24}",
            if check.passed { "ok" } else { "FAIL" },
            check.name
        );
        if let Some(m) = check.measured {
            line.push_str(&format!(" measured {}", m));
        }
        if let Some(t) = check.threshold {
            line.push_str(&format!(" threshold {}", t));
        }
        if !check.detail.is_empty() {
            line.push_str(&format!("  {}", check.detail));
        }
        println!("{}", line);
    }

    println!();
    let mismatched = store.verify(&id)?;
    if mismatched.is_empty() {
        println!("  Files: {} verified", manifest.files.len());
    } else {
        println!("  Files: {} do not match the manifest", mismatched.len());
        for path in &mismatched {
            println!("    {}", path);
        }
        bail!("Release {} failed verification", id);
    }
    Ok(())
}

/// Print the most recent runs from the ledger.
pub async fn run_history(config: &Config, limit: i64) -> Result<()> {
    let ledger = Ledger::open(&config.store).await?;
    let runs = ledger.recent_runs(limit).await?;
    let issue = ledger.open_issue().await?;
    ledger.close().await;

    if runs.is_empty() {
        println!("No runs recorded.");
    } else {
        println!(
            "  {:<10} {:<20} {:<11} {:<18} {}",
            "RUN", "STARTED", "MODE", "OUTCOME", "DETAIL"
        );
        println!("  {}", "-".repeat(90));
        for run in &runs {
            let detail = match (&run.release_id, &run.failed_stage, &run.error) {
                (Some(release), _, _) => release.clone(),
                (None, Some(stage), Some(error)) => format!("{}: {}", stage, first_line(error)),
                (None, Some(stage), None) => stage.clone(),
                _ => run.source_version.clone().unwrap_or_default(),
            };
            println!(
                "  {:<10} {:<20} {:<11} {:<18} {}",
                run.id.get(..8).unwrap_or(&run.id),
                format_ts(run.started_at),
                run.mode,
                run.outcome,
                detail
            );
        }
    }

    if let Some(issue) = issue {
        println!();
        println!(
            "  Open issue #{}: {} ({} occurrence(s), last run {})",
            issue.id, issue.title, issue.occurrences, issue.last_run_id
        );
    }
    Ok(())
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or("")
}
