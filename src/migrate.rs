use anyhow::Result;
use sqlx::SqlitePool;

/// Create the ledger tables. Safe to run repeatedly.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // One row per pipeline run
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            mode TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            finished_at INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            source_version TEXT,
            release_id TEXT,
            failed_stage TEXT,
            error TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Failure issues; at most one is open (closed_at IS NULL) at a time
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS issues (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            opened_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            closed_at INTEGER,
            occurrences INTEGER NOT NULL DEFAULT 1,
            last_stage TEXT NOT NULL,
            last_error TEXT NOT NULL,
            last_run_id TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_started_at ON runs(started_at DESC)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_issues_closed_at ON issues(closed_at)")
        .execute(pool)
        .await?;

    Ok(())
}
