//! # Trailforge CLI (`trailforge`)
//!
//! ## Usage
//!
//! ```bash
//! trailforge --config ./config/trailforge.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `trailforge init` | Create the release store and the run ledger |
//! | `trailforge run` | Fetch, build, validate and publish a release |
//! | `trailforge run --force` | Same, skipping change detection |
//! | `trailforge check` | Report whether a newer snapshot is available |
//! | `trailforge schedule` | Run at a fixed interval until interrupted |
//! | `trailforge releases` | List published releases |
//! | `trailforge inspect [id]` | Show a release and verify its files |
//! | `trailforge history` | Show recent runs and the open issue |
//!
//! ## Exit codes
//!
//! `run` and `schedule`: 0 released, 1 failed, 3 skipped (no change),
//! 4 cancelled. `check`: 0 when an update is due, 3 when not.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;

use trailforge::config::{self, Config};
use trailforge::ledger::Ledger;
use trailforge::pipeline::{Pipeline, RunMode, RunOutcome, RunReport};
use trailforge::progress::ProgressMode;
use trailforge::{inspect, logging, source};

/// Trailforge: quality-gated releases of the national trail network.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/trailforge.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "trailforge",
    about = "Quality-gated release pipeline for the national trail network",
    version,
    long_about = "Trailforge downloads the national trail dataset, maps its attributes to a \
    canonical tag set, assembles a routable network, runs quality checks and publishes \
    versioned releases atomically."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/trailforge.toml")]
    config: PathBuf,

    /// Log level used when `RUST_LOG` is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Stage progress on stderr: `human`, `json` or `off`.
    ///
    /// Defaults to `human` when stderr is a terminal, otherwise `off`.
    #[arg(long, global = true, value_parser = ProgressMode::parse)]
    progress: Option<ProgressMode>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Create the store directories and the run ledger.
    ///
    /// Idempotent: running it again is safe.
    Init,

    /// Execute one pipeline run.
    Run {
        /// Rebuild even if the source version is already released.
        #[arg(long)]
        force: bool,
    },

    /// Consult the change feed only; never downloads or publishes.
    ///
    /// Exits 0 when an update is due and 3 when not.
    Check,

    /// Run at a fixed interval until interrupted.
    Schedule {
        /// Seconds between runs (overrides `pipeline.schedule_interval_secs`).
        #[arg(long)]
        interval: Option<u64>,
    },

    /// List published releases, newest first.
    Releases,

    /// Show a release's manifest and quality report and verify its files.
    Inspect {
        /// Release id (defaults to the current release).
        id: Option<String>,
    },

    /// Show recent runs from the ledger.
    History {
        /// Maximum number of runs to show.
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let cfg = config::load_config(&cli.config)?;
    let progress = ProgressMode::resolve(cli.progress);

    match cli.command {
        Commands::Init => {
            init_store(&cfg).await?;
            println!("Store initialized at {}", cfg.store.root.display());
        }
        Commands::Run { force } => {
            let mode = if force {
                RunMode::Force
            } else {
                RunMode::Normal
            };
            let report = pipeline(&cfg, progress)?.run(mode).await?;
            print_report(&report);
            std::process::exit(report.outcome.exit_code());
        }
        Commands::Check => {
            let report = pipeline(&cfg, progress)?.run(RunMode::CheckOnly).await?;
            print_report(&report);
            std::process::exit(report.outcome.exit_code());
        }
        Commands::Schedule { interval } => {
            let interval = Duration::from_secs(
                interval.unwrap_or(cfg.pipeline.schedule_interval_secs),
            );
            let mut last_code = 0;
            pipeline(&cfg, progress)?
                .schedule(interval, |report| {
                    print_report(report);
                    last_code = report.outcome.exit_code();
                })
                .await?;
            std::process::exit(last_code);
        }
        Commands::Releases => {
            inspect::run_releases(&cfg)?;
        }
        Commands::Inspect { id } => {
            inspect::run_inspect(&cfg, id.as_deref())?;
        }
        Commands::History { limit } => {
            inspect::run_history(&cfg, limit).await?;
        }
    }

    Ok(())
}

async fn init_store(cfg: &Config) -> Result<()> {
    for dir in [
        cfg.store.root.clone(),
        cfg.store.releases_dir(),
        cfg.store.reports_dir(),
        cfg.store.work_dir(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }
    Ledger::open(&cfg.store).await?.close().await;
    Ok(())
}

/// Build a pipeline whose runs are cancelled by Ctrl-C.
fn pipeline(cfg: &Config, progress: ProgressMode) -> Result<Pipeline<'_>> {
    let source = source::source_from_config(&cfg.source)?;
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling");
            let _ = tx.send(true);
        }
    });
    Ok(Pipeline::new(cfg, source)
        .with_progress(progress.reporter())
        .with_cancel(rx))
}

fn print_report(report: &RunReport) {
    println!("{}", report.summary());
    match &report.outcome {
        RunOutcome::Released { .. } => {
            for removed in &report.removed_releases {
                println!("  removed old release {}", removed);
            }
            for repair in &report.repairs {
                println!(
                    "  repaired {} ({} vertices removed)",
                    repair.segment_id, repair.removed_vertices
                );
            }
        }
        RunOutcome::Failed { .. } => {
            if let Some(quality) = &report.quality {
                for check in quality.failures() {
                    println!("  failed check {}: {}", check.name, check.detail);
                }
            }
        }
        _ => {}
    }
    println!("  run {} ({})", report.run_id, report.outcome.label());
}
