//! Release orchestrator.
//!
//! A run is a linear state machine:
//!
//! ```text
//! Fetching → ChangeCheck ─┬→ SkippedNoChange
//!                         └→ Mapping → Assembling → Building → Validating → Releasing → Released
//! (any state) → Failed | Cancelled
//! ```
//!
//! No state is re-entered and nothing is retried here; only the fetcher
//! retries, inside `Fetching`. Each state runs under the run deadline and
//! the cancellation signal; whichever fires first ends the run in that
//! state. At most one run holds the store at a time (`run.lock`).
//!
//! Every run, whatever its outcome, writes `reports/<run-id>.json`, is
//! recorded in the ledger, and emits a notification.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::assemble::{assemble, AssemblyError, MappedSegment};
use crate::build::{build, BuildError};
use crate::change::has_changed;
use crate::codes::load_code_table;
use crate::config::Config;
use crate::decode::{decode_snapshot, DecodeError};
use crate::fetch::{fetch, Clock, FetchError, TokioClock};
use crate::ledger::{IssueEvent, Ledger, RunRecord};
pub use crate::lock::{LockHeld, RunLock};
use crate::mapping::Mapper;
use crate::models::Repair;
use crate::notify::Notifier;
use crate::progress::{NoProgress, ProgressEvent, ProgressReporter};
use crate::quality::{validate, QualityReport, ValidationError};
use crate::release::{write_atomic, ReleaseError, ReleaseStore};
use crate::source::SnapshotSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Fetching,
    ChangeCheck,
    SkippedNoChange,
    Mapping,
    Assembling,
    Building,
    Validating,
    Releasing,
    Released,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Fetching => "fetching",
            RunState::ChangeCheck => "change_check",
            RunState::SkippedNoChange => "skipped_no_change",
            RunState::Mapping => "mapping",
            RunState::Assembling => "assembling",
            RunState::Building => "building",
            RunState::Validating => "validating",
            RunState::Releasing => "releasing",
            RunState::Released => "released",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Normal,
    /// Skip change detection and rebuild even if the version is unchanged.
    Force,
    /// Consult only the change feed; never download or publish.
    CheckOnly,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Normal => "normal",
            RunMode::Force => "force",
            RunMode::CheckOnly => "check_only",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunOutcome {
    Released { release_id: String },
    SkippedNoChange { version: String },
    /// Check-only runs: a newer version is available.
    UpdateAvailable {
        version: String,
        previous: Option<String>,
    },
    Failed {
        stage: RunState,
        component: String,
        error: String,
    },
    Cancelled { stage: RunState },
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Released { .. } | RunOutcome::UpdateAvailable { .. } => 0,
            RunOutcome::Failed { .. } => 1,
            RunOutcome::SkippedNoChange { .. } => 3,
            RunOutcome::Cancelled { .. } => 4,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Released { .. } => "released",
            RunOutcome::SkippedNoChange { .. } => "skipped_no_change",
            RunOutcome::UpdateAvailable { .. } => "update_available",
            RunOutcome::Failed { .. } => "failed",
            RunOutcome::Cancelled { .. } => "cancelled",
        }
    }
}

/// A stage failure, wrapping the failing component's error.
#[derive(Debug)]
pub enum PipelineError {
    Fetch(FetchError),
    Decode(DecodeError),
    Assembly(AssemblyError),
    Build(BuildError),
    Validation(ValidationError),
    Release(ReleaseError),
    Config(anyhow::Error),
    Timeout(Duration),
    /// A stage's worker task panicked or was aborted.
    Worker(String),
}

impl PipelineError {
    /// The component that raised the error.
    pub fn component(&self) -> &'static str {
        match self {
            PipelineError::Fetch(_) => "fetcher",
            PipelineError::Decode(_) => "decoder",
            PipelineError::Assembly(_) => "assembler",
            PipelineError::Build(_) => "graph builder",
            PipelineError::Validation(_) => "quality validator",
            PipelineError::Release(_) => "release manager",
            PipelineError::Config(_) => "configuration",
            PipelineError::Timeout(_) | PipelineError::Worker(_) => "orchestrator",
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Fetch(e) => write!(f, "{}", e),
            PipelineError::Decode(e) => write!(f, "{}", e),
            PipelineError::Assembly(e) => write!(f, "{}", e),
            PipelineError::Build(e) => write!(f, "{}", e),
            PipelineError::Validation(e) => write!(f, "{}", e),
            PipelineError::Release(e) => write!(f, "{}", e),
            PipelineError::Config(e) => write!(f, "{:#}", e),
            PipelineError::Timeout(limit) => {
                write!(f, "run deadline of {}s exceeded", limit.as_secs())
            }
            PipelineError::Worker(e) => write!(f, "stage worker failed: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<FetchError> for PipelineError {
    fn from(e: FetchError) -> Self {
        PipelineError::Fetch(e)
    }
}
impl From<DecodeError> for PipelineError {
    fn from(e: DecodeError) -> Self {
        PipelineError::Decode(e)
    }
}
impl From<AssemblyError> for PipelineError {
    fn from(e: AssemblyError) -> Self {
        PipelineError::Assembly(e)
    }
}
impl From<BuildError> for PipelineError {
    fn from(e: BuildError) -> Self {
        PipelineError::Build(e)
    }
}
impl From<ValidationError> for PipelineError {
    fn from(e: ValidationError) -> Self {
        PipelineError::Validation(e)
    }
}
impl From<ReleaseError> for PipelineError {
    fn from(e: ReleaseError) -> Self {
        PipelineError::Release(e)
    }
}

/// Why a run stopped before a terminal success state.
enum Halt {
    Failed(RunState, PipelineError),
    Cancelled(RunState),
}

/// Everything recorded about one run. Written to `reports/<run-id>.json`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    pub source: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Every state entered, in order.
    pub states: Vec<RunState>,
    pub outcome: RunOutcome,
    pub source_version: Option<String>,
    pub release_id: Option<String>,
    pub segment_count: Option<usize>,
    pub skipped_non_line: usize,
    pub trimmed_multi: Vec<String>,
    /// English attribute name → number of segments carrying it.
    pub attribute_coverage: BTreeMap<String, usize>,
    pub edge_count: Option<usize>,
    pub node_count: Option<usize>,
    pub repairs: Vec<Repair>,
    pub removed_releases: Vec<String>,
    pub quality: Option<QualityReport>,
}

impl RunReport {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        let version = self.source_version.as_deref().unwrap_or("unknown");
        match &self.outcome {
            RunOutcome::Released { release_id } => format!(
                "released {} (source version {}, {} edges, {} nodes)",
                release_id,
                version,
                self.edge_count.unwrap_or(0),
                self.node_count.unwrap_or(0)
            ),
            RunOutcome::SkippedNoChange { version } => {
                format!("skipped: source version {} is already released", version)
            }
            RunOutcome::UpdateAvailable { version, previous } => format!(
                "update available: {} (last released: {})",
                version,
                previous.as_deref().unwrap_or("none")
            ),
            RunOutcome::Failed {
                stage,
                component,
                error,
            } => format!("failed at {} in {}: {}", stage, component, error),
            RunOutcome::Cancelled { stage } => format!("cancelled during {}", stage),
        }
    }

    fn record(&self) -> RunRecord {
        let (failed_stage, error) = match &self.outcome {
            RunOutcome::Failed { stage, error, .. } => {
                (Some(stage.to_string()), Some(error.clone()))
            }
            RunOutcome::Cancelled { stage } => (Some(stage.to_string()), None),
            _ => (None, None),
        };
        RunRecord {
            id: self.run_id.clone(),
            mode: self.mode.as_str().to_string(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome.label().to_string(),
            source_version: self.source_version.clone(),
            release_id: self.release_id.clone(),
            failed_stage,
            error,
        }
    }
}

/// Mutable state collected while a run progresses.
struct RunContext {
    run_id: String,
    deadline: Instant,
    states: Vec<RunState>,
    source_version: Option<String>,
    release_id: Option<String>,
    segment_count: Option<usize>,
    skipped_non_line: usize,
    trimmed_multi: Vec<String>,
    attribute_coverage: BTreeMap<String, usize>,
    edge_count: Option<usize>,
    node_count: Option<usize>,
    repairs: Vec<Repair>,
    removed_releases: Vec<String>,
    quality: Option<QualityReport>,
}

impl RunContext {
    fn new(run_id: String, deadline: Instant) -> Self {
        Self {
            run_id,
            deadline,
            states: Vec::new(),
            source_version: None,
            release_id: None,
            segment_count: None,
            skipped_non_line: 0,
            trimmed_multi: Vec::new(),
            attribute_coverage: BTreeMap::new(),
            edge_count: None,
            node_count: None,
            repairs: Vec::new(),
            removed_releases: Vec::new(),
            quality: None,
        }
    }
}

pub struct Pipeline<'a> {
    config: &'a Config,
    source: Box<dyn SnapshotSource>,
    clock: Arc<dyn Clock>,
    progress: Box<dyn ProgressReporter>,
    cancel: watch::Receiver<bool>,
}

impl<'a> Pipeline<'a> {
    pub fn new(config: &'a Config, source: Box<dyn SnapshotSource>) -> Self {
        // The sender is dropped at once: never cancelled.
        let (_, cancel) = watch::channel(false);
        Self {
            config,
            source,
            clock: Arc::new(TokioClock),
            progress: Box::new(NoProgress),
            cancel,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_progress(mut self, progress: Box<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Cancel the run (or schedule) when `true` is sent.
    pub fn with_cancel(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Execute one run. `Err` only for infrastructure problems (lock held,
    /// report not writable); pipeline failures are a `Failed` outcome.
    pub async fn run(&self, mode: RunMode) -> Result<RunReport> {
        let store = &self.config.store;
        std::fs::create_dir_all(&store.root)
            .with_context(|| format!("Failed to create store root: {}", store.root.display()))?;
        let run_id = Uuid::new_v4().to_string();
        let _lock = RunLock::acquire(&store.lock_path(), &run_id)?;

        let started_at = self.clock.now();
        let mut ctx = RunContext::new(
            run_id,
            Instant::now() + self.config.pipeline.run_timeout(),
        );
        let work_dir = store.work_dir().join(&ctx.run_id);
        tracing::info!(
            run_id = %ctx.run_id,
            mode = mode.as_str(),
            source = %self.source.describe(),
            "run started"
        );

        let outcome = match self.execute(&mut ctx, mode, &work_dir).await {
            Ok(outcome) => outcome,
            Err(Halt::Failed(stage, error)) => {
                self.enter(&mut ctx, RunState::Failed);
                tracing::error!(stage = %stage, component = error.component(), error = %error, "run failed");
                RunOutcome::Failed {
                    stage,
                    component: error.component().to_string(),
                    error: error.to_string(),
                }
            }
            Err(Halt::Cancelled(stage)) => {
                self.enter(&mut ctx, RunState::Cancelled);
                tracing::warn!(stage = %stage, "run cancelled");
                RunOutcome::Cancelled { stage }
            }
        };

        if work_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&work_dir) {
                tracing::warn!(path = %work_dir.display(), error = %e, "failed to remove work dir");
            }
        }

        let report = RunReport {
            run_id: ctx.run_id,
            mode,
            source: self.source.describe(),
            started_at,
            finished_at: self.clock.now(),
            states: ctx.states,
            outcome,
            source_version: ctx.source_version,
            release_id: ctx.release_id,
            segment_count: ctx.segment_count,
            skipped_non_line: ctx.skipped_non_line,
            trimmed_multi: ctx.trimmed_multi,
            attribute_coverage: ctx.attribute_coverage,
            edge_count: ctx.edge_count,
            node_count: ctx.node_count,
            repairs: ctx.repairs,
            removed_releases: ctx.removed_releases,
            quality: ctx.quality,
        };
        self.persist(&report).await?;
        Ok(report)
    }

    /// Run every `interval` until cancelled. A tick that finds the store
    /// locked is skipped.
    pub async fn schedule<F>(&self, interval: Duration, mut on_report: F) -> Result<()>
    where
        F: FnMut(&RunReport),
    {
        loop {
            match self.run(RunMode::Normal).await {
                Ok(report) => {
                    on_report(&report);
                    if matches!(report.outcome, RunOutcome::Cancelled { .. }) {
                        return Ok(());
                    }
                }
                Err(e) if e.downcast_ref::<LockHeld>().is_some() => {
                    tracing::warn!(error = %e, "run already in progress, skipping tick");
                }
                Err(e) => return Err(e),
            }

            tracing::info!(next_in_secs = interval.as_secs(), "waiting for next scheduled run");
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = cancelled(self.cancel.clone()) => return Ok(()),
            }
        }
    }

    async fn execute(
        &self,
        ctx: &mut RunContext,
        mode: RunMode,
        work_dir: &Path,
    ) -> Result<RunOutcome, Halt> {
        let releases = ReleaseStore::new(&self.config.store);
        let run_id = ctx.run_id.clone();

        if mode == RunMode::CheckOnly {
            let version = self
                .stage(ctx, RunState::Fetching, async {
                    Ok::<_, PipelineError>(self.source.latest_version().await?)
                })
                .await?;
            ctx.source_version = Some(version.clone());
            let previous = self
                .stage(ctx, RunState::ChangeCheck, async { Ok::<_, PipelineError>(releases.latest()?) })
                .await?;
            if has_changed(&version, previous.as_ref()) {
                return Ok(RunOutcome::UpdateAvailable {
                    version,
                    previous: previous.map(|m| m.source_version),
                });
            }
            self.enter(ctx, RunState::SkippedNoChange);
            return Ok(RunOutcome::SkippedNoChange { version });
        }

        let mut snapshot = self
            .stage(ctx, RunState::Fetching, async {
                Ok::<_, PipelineError>(fetch(self.source.as_ref(), &self.config.fetch, self.clock.as_ref()).await?)
            })
            .await?;
        ctx.source_version = Some(snapshot.version.clone());

        let previous = self
            .stage(ctx, RunState::ChangeCheck, async { Ok::<_, PipelineError>(releases.latest()?) })
            .await?;
        match mode {
            RunMode::Force => {
                tracing::info!(version = %snapshot.version, "forced run, change detection skipped")
            }
            _ if !has_changed(&snapshot.version, previous.as_ref()) => {
                tracing::info!(version = %snapshot.version, "source unchanged since last release");
                self.enter(ctx, RunState::SkippedNoChange);
                return Ok(RunOutcome::SkippedNoChange {
                    version: snapshot.version,
                });
            }
            _ => {}
        }

        let payload = std::mem::take(&mut snapshot.payload);
        let fetched_at = snapshot.fetched_at;
        let code_table = self.config.mapping.code_table.clone();
        let (mapped, trail_field, decoded_stats) = self
            .stage(ctx, RunState::Mapping, off_runtime(move || {
                let table = load_code_table(code_table.as_deref()).map_err(PipelineError::Config)?;
                let decoded = decode_snapshot(&payload, &table.fields.segment_id)?;
                let trail_field = table.fields.trail_number.clone();
                let coverage: BTreeMap<String, usize> = decoded
                    .attribute_counts
                    .iter()
                    .map(|(raw, n)| (table.english_column(raw).to_string(), *n))
                    .collect();
                let mapper = Mapper::new(table, fetched_at);
                let mapped: Vec<MappedSegment> = decoded
                    .segments
                    .into_iter()
                    .map(|segment| MappedSegment {
                        edge: mapper.map(&segment),
                        segment,
                    })
                    .collect();
                Ok((
                    mapped,
                    trail_field,
                    (decoded.skipped_non_line, decoded.trimmed_multi, coverage),
                ))
            }))
            .await?;
        ctx.segment_count = Some(mapped.len());
        (ctx.skipped_non_line, ctx.trimmed_multi, ctx.attribute_coverage) = decoded_stats;
        self.counted(ctx, RunState::Mapping, "segments", mapped.len());

        let graph = self
            .stage(ctx, RunState::Assembling, {
                let assembly = self.config.assembly.clone();
                off_runtime(move || Ok(assemble(mapped, &trail_field, &assembly)?))
            })
            .await?;
        ctx.edge_count = Some(graph.edge_count());
        ctx.node_count = Some(graph.node_count());
        ctx.repairs = graph.repairs.clone();
        self.counted(ctx, RunState::Assembling, "edges", graph.edge_count());

        let artifact_dir = work_dir.join("artifact");
        let artifact = self
            .stage(ctx, RunState::Building, async {
                Ok::<_, PipelineError>(build(&graph, &artifact_dir, &self.config.build).await?)
            })
            .await?;

        let quality = self
            .stage(ctx, RunState::Validating, async {
                Ok::<_, PipelineError>(validate(
                    &artifact,
                    &graph,
                    previous.as_ref(),
                    &self.config.quality,
                    &run_id,
                    &snapshot.version,
                ))
            })
            .await?;
        ctx.quality = Some(quality.clone());
        if let Err(e) = quality.ensure_passed() {
            return Err(Halt::Failed(RunState::Validating, e.into()));
        }

        let (release, removed) = self
            .stage(ctx, RunState::Releasing, async {
                let release =
                    releases.publish(&artifact, &quality, &graph, &snapshot, self.clock.now())?;
                let removed = match releases.retain(self.config.release.keep) {
                    Ok(removed) => removed,
                    Err(e) => {
                        tracing::warn!(error = %e, "retention failed; release is published");
                        Vec::new()
                    }
                };
                Ok::<_, PipelineError>((release, removed))
            })
            .await?;
        ctx.release_id = Some(release.id.clone());
        ctx.removed_releases = removed;
        self.enter(ctx, RunState::Released);

        Ok(RunOutcome::Released {
            release_id: release.id,
        })
    }

    /// Enter `state` and drive `work` to completion unless the run is
    /// cancelled or its deadline passes first.
    async fn stage<T, F>(&self, ctx: &mut RunContext, state: RunState, work: F) -> Result<T, Halt>
    where
        F: Future<Output = Result<T, PipelineError>>,
    {
        self.enter(ctx, state);
        if *self.cancel.borrow() {
            return Err(Halt::Cancelled(state));
        }
        if Instant::now() >= ctx.deadline {
            return Err(Halt::Failed(
                state,
                PipelineError::Timeout(self.config.pipeline.run_timeout()),
            ));
        }

        let result = tokio::select! {
            result = work => result.map_err(|e| Halt::Failed(state, e)),
            _ = cancelled(self.cancel.clone()) => Err(Halt::Cancelled(state)),
            _ = tokio::time::sleep_until(ctx.deadline) => Err(Halt::Failed(
                state,
                PipelineError::Timeout(self.config.pipeline.run_timeout()),
            )),
        };
        // Work that never yielded can finish past the deadline; the overrun
        // belongs to this stage, not the next.
        if result.is_ok() && Instant::now() >= ctx.deadline {
            return Err(Halt::Failed(
                state,
                PipelineError::Timeout(self.config.pipeline.run_timeout()),
            ));
        }
        result
    }

    fn enter(&self, ctx: &mut RunContext, state: RunState) {
        tracing::debug!(run_id = %ctx.run_id, state = %state, "state transition");
        ctx.states.push(state);
        self.progress.report(ProgressEvent::Stage {
            run_id: ctx.run_id.clone(),
            state,
        });
    }

    fn counted(&self, ctx: &RunContext, state: RunState, what: &'static str, n: usize) {
        self.progress.report(ProgressEvent::Counted {
            run_id: ctx.run_id.clone(),
            state,
            what,
            n: n as u64,
        });
    }

    /// Write the run report, record the run, track issues, and notify.
    async fn persist(&self, report: &RunReport) -> Result<()> {
        let reports = self.config.store.reports_dir();
        std::fs::create_dir_all(&reports)
            .with_context(|| format!("Failed to create reports dir: {}", reports.display()))?;
        let json = serde_json::to_vec_pretty(report)?;
        write_atomic(&reports.join(format!("{}.json", report.run_id)), &json)?;

        let issue = match Ledger::open(&self.config.store).await {
            Ok(ledger) => {
                let event = track(&ledger, report).await;
                ledger.close().await;
                event
            }
            Err(e) => {
                tracing::warn!(error = %e, "ledger unavailable; run not recorded");
                None
            }
        };

        match Notifier::new(&self.config.notifications) {
            Ok(notifier) => notifier.send(report, issue.as_ref()).await,
            Err(e) => tracing::warn!(error = %e, "notifier unavailable"),
        }
        Ok(())
    }
}

async fn track(ledger: &Ledger, report: &RunReport) -> Option<IssueEvent> {
    if let Err(e) = ledger.record_run(&report.record()).await {
        tracing::warn!(error = %e, "failed to record run");
    }
    if report.mode == RunMode::CheckOnly {
        return None;
    }
    let event = match &report.outcome {
        RunOutcome::Failed { stage, error, .. } => ledger
            .report_failure(&report.run_id, stage.as_str(), error)
            .await
            .map(Some),
        RunOutcome::Released { .. } | RunOutcome::SkippedNoChange { .. } => {
            ledger.resolve(&report.run_id).await
        }
        RunOutcome::UpdateAvailable { .. } | RunOutcome::Cancelled { .. } => Ok(None),
    };
    event.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to update issue tracker");
        None
    })
}

/// Run CPU-bound stage work on the blocking pool, so the stage guard can
/// still react to cancellation and the deadline while it runs.
async fn off_runtime<T, F>(work: F) -> Result<T, PipelineError>
where
    F: FnOnce() -> Result<T, PipelineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Worker(e.to_string()))?
}

/// Resolves once `true` has been sent. Never resolves if the sender is gone.
async fn cancelled(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
