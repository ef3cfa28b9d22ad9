//! Run progress reporting.
//!
//! Reports which pipeline stage a run is in, and how many items a stage
//! produced, so operators can follow a long run. Progress goes to
//! **stderr**; stdout carries only the run summary.

use std::io::Write;
use std::time::Instant;

use crate::pipeline::RunState;

/// A single progress event for a run.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// The run entered a new state.
    Stage { run_id: String, state: RunState },
    /// A stage finished producing `n` items of `what`.
    Counted {
        run_id: String,
        state: RunState,
        what: &'static str,
        n: u64,
    },
}

pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly lines with elapsed time:
/// `[  41.2s] run 3f2a91c0  assembling: 12,345 edges`.
pub struct StderrProgress {
    started: Instant,
}

impl StderrProgress {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for StderrProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let elapsed = self.started.elapsed().as_secs_f64();
        let body = match &event {
            ProgressEvent::Stage { run_id, state } => {
                format!("run {}  {}", short(run_id), state)
            }
            ProgressEvent::Counted {
                run_id,
                state,
                what,
                n,
            } => format!(
                "run {}  {}: {} {}",
                short(run_id),
                state,
                format_number(*n),
                what
            ),
        };
        let mut err = std::io::stderr().lock();
        let _ = writeln!(err, "[{:>7.1}s] {}", elapsed, body);
        let _ = err.flush();
    }
}

/// One JSON object per line on stderr, for log shippers.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let ts = chrono::Utc::now().to_rfc3339();
        let obj = match &event {
            ProgressEvent::Stage { run_id, state } => serde_json::json!({
                "ts": ts,
                "run_id": run_id,
                "state": state,
            }),
            ProgressEvent::Counted {
                run_id,
                state,
                what,
                n,
            } => serde_json::json!({
                "ts": ts,
                "run_id": run_id,
                "state": state,
                "count": { "what": what, "n": n },
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn short(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

/// `1234567` → `1,234,567`.
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

/// `--progress` setting.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            "off" => Ok(ProgressMode::Off),
            other => Err(format!(
                "invalid progress mode '{}': expected human, json or off",
                other
            )),
        }
    }

    /// The requested mode, else human output when stderr is a terminal.
    pub fn resolve(requested: Option<Self>) -> Self {
        requested.unwrap_or_else(|| {
            if atty::is(atty::Stream::Stderr) {
                ProgressMode::Human
            } else {
                ProgressMode::Off
            }
        })
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress::new()),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}
