//! Run history and failure issues, stored in SQLite.
//!
//! Every run is recorded in `runs`. Failures open an issue in `issues`; a
//! repeated failure re-uses the open issue and bumps its occurrence count
//! instead of opening another, and the next successful run closes it.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};

use crate::config::StoreConfig;
use crate::db;
use crate::migrate;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: String,
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcome: String,
    pub source_version: Option<String>,
    pub release_id: Option<String>,
    pub failed_stage: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Issue {
    pub id: i64,
    pub title: String,
    pub occurrences: i64,
    pub last_stage: String,
    pub last_error: String,
    pub last_run_id: String,
}

/// What happened to the issue tracker as a result of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IssueEvent {
    Opened { issue: Issue },
    Updated { issue: Issue },
    Closed { issue_id: i64, run_id: String },
}

pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    /// Connect and apply migrations.
    pub async fn open(store: &StoreConfig) -> Result<Self> {
        let pool = db::connect(store).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    pub async fn record_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, mode, started_at, finished_at, outcome,
                              source_version, release_id, failed_stage, error)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.mode)
        .bind(run.started_at.timestamp())
        .bind(run.finished_at.timestamp())
        .bind(&run.outcome)
        .bind(&run.source_version)
        .bind(&run.release_id)
        .bind(&run.failed_stage)
        .bind(&run.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent runs first.
    pub async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, mode, started_at, finished_at, outcome,
                   source_version, release_id, failed_stage, error
            FROM runs
            ORDER BY started_at DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RunRecord {
                id: row.get("id"),
                mode: row.get("mode"),
                started_at: from_ts(row.get("started_at")),
                finished_at: from_ts(row.get("finished_at")),
                outcome: row.get("outcome"),
                source_version: row.get("source_version"),
                release_id: row.get("release_id"),
                failed_stage: row.get("failed_stage"),
                error: row.get("error"),
            })
            .collect())
    }

    pub async fn open_issue(&self) -> Result<Option<Issue>> {
        let row = sqlx::query(
            r#"
            SELECT id, title, occurrences, last_stage, last_error, last_run_id
            FROM issues
            WHERE closed_at IS NULL
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| Issue {
            id: row.get("id"),
            title: row.get("title"),
            occurrences: row.get("occurrences"),
            last_stage: row.get("last_stage"),
            last_error: row.get("last_error"),
            last_run_id: row.get("last_run_id"),
        }))
    }

    /// Open an issue for a failed run, or re-use the one already open.
    pub async fn report_failure(&self, run_id: &str, stage: &str, error: &str) -> Result<IssueEvent> {
        let now = Utc::now().timestamp();

        if let Some(open) = self.open_issue().await? {
            sqlx::query(
                r#"
                UPDATE issues
                SET occurrences = occurrences + 1, updated_at = ?,
                    last_stage = ?, last_error = ?, last_run_id = ?
                WHERE id = ?
                "#,
            )
            .bind(now)
            .bind(stage)
            .bind(error)
            .bind(run_id)
            .bind(open.id)
            .execute(&self.pool)
            .await?;

            let issue = Issue {
                occurrences: open.occurrences + 1,
                last_stage: stage.to_string(),
                last_error: error.to_string(),
                last_run_id: run_id.to_string(),
                ..open
            };
            return Ok(IssueEvent::Updated { issue });
        }

        let title = format!("Trail release pipeline failing at {}", stage);
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO issues (title, opened_at, updated_at, occurrences,
                                last_stage, last_error, last_run_id)
            VALUES (?, ?, ?, 1, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&title)
        .bind(now)
        .bind(now)
        .bind(stage)
        .bind(error)
        .bind(run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(IssueEvent::Opened {
            issue: Issue {
                id,
                title,
                occurrences: 1,
                last_stage: stage.to_string(),
                last_error: error.to_string(),
                last_run_id: run_id.to_string(),
            },
        })
    }

    /// Close the open issue after a successful run. `None` when nothing was open.
    pub async fn resolve(&self, run_id: &str) -> Result<Option<IssueEvent>> {
        let Some(open) = self.open_issue().await? else {
            return Ok(None);
        };
        sqlx::query("UPDATE issues SET closed_at = ?, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(Utc::now().timestamp())
            .bind(open.id)
            .execute(&self.pool)
            .await?;
        Ok(Some(IssueEvent::Closed {
            issue_id: open.id,
            run_id: run_id.to_string(),
        }))
    }
}

fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn ledger() -> (TempDir, Ledger) {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::open(&StoreConfig {
            root: tmp.path().to_path_buf(),
        })
        .await
        .unwrap();
        (tmp, ledger)
    }

    fn run(id: &str, started: i64, outcome: &str) -> RunRecord {
        RunRecord {
            id: id.to_string(),
            mode: "normal".to_string(),
            started_at: from_ts(started),
            finished_at: from_ts(started + 60),
            outcome: outcome.to_string(),
            source_version: Some("v1".to_string()),
            release_id: None,
            failed_stage: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn runs_round_trip_newest_first() {
        let (_tmp, ledger) = ledger().await;
        ledger.record_run(&run("a", 1_000, "released")).await.unwrap();
        ledger.record_run(&run("b", 2_000, "skipped_no_change")).await.unwrap();
        let runs = ledger.recent_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], run("b", 2_000, "skipped_no_change"));
    }

    #[tokio::test]
    async fn repeated_failures_reuse_open_issue() {
        let (_tmp, ledger) = ledger().await;
        let first = ledger.report_failure("r1", "building", "exit 1").await.unwrap();
        let IssueEvent::Opened { issue } = first else {
            panic!("expected a new issue, got {:?}", first);
        };
        let second = ledger.report_failure("r2", "validating", "bbox").await.unwrap();
        match second {
            IssueEvent::Updated { issue: updated } => {
                assert_eq!(updated.id, issue.id);
                assert_eq!(updated.occurrences, 2);
                assert_eq!(updated.last_stage, "validating");
            }
            other => panic!("expected update, got {:?}", other),
        }
        assert_eq!(ledger.open_issue().await.unwrap().unwrap().occurrences, 2);
    }

    #[tokio::test]
    async fn success_closes_issue_and_next_failure_opens_new_one() {
        let (_tmp, ledger) = ledger().await;
        ledger.report_failure("r1", "fetching", "HTTP 503").await.unwrap();
        let closed = ledger.resolve("r2").await.unwrap();
        assert!(matches!(closed, Some(IssueEvent::Closed { .. })));
        assert!(ledger.open_issue().await.unwrap().is_none());
        assert!(ledger.resolve("r3").await.unwrap().is_none());

        let again = ledger.report_failure("r4", "fetching", "HTTP 503").await.unwrap();
        assert!(matches!(again, IssueEvent::Opened { .. }));
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let (tmp, ledger) = ledger().await;
        ledger.close().await;
        let reopened = Ledger::open(&StoreConfig {
            root: tmp.path().to_path_buf(),
        })
        .await
        .unwrap();
        assert!(reopened.recent_runs(5).await.unwrap().is_empty());
    }
}
