//! Database schema migrations.
//!
//! Creates all required tables and ensures idempotent execution.
//! Designed to be run via `triage init`.
//!
//! # Schema
//!
//! ```text
//! ┌───────────────┐     ┌───────────────┐     ┌──────────────────┐
//! │ repositories  │──┐  │     runs      │──┐  │      chunks      │
//! │               │  │  │               │  │  │                  │
//! │ id (PK)       │  │  │ id (PK)       │  │  │ id (PK)          │
//! │ provider_id   │  └──│ repo_id       │  └──│ run_id           │
//! │ owner         │     │ provider_run_ │     │ chunk_index      │
//! │ name          │     │   id (UQ)     │     │ step_name        │
//! │ private       │     │ workflow_name │     │ content          │
//! │ user_id       │     │ status        │     │ start/end_line   │
//! └───────────────┘     │ trigger       │     │ token_estimate   │
//!                       │ commit_sha    │     │ has_errors       │
//! ┌───────────────┐     │ branch        │     │ error_count      │
//! │     jobs      │     │ actor         │     │ embedding (NULL) │
//! │               │     │ provider_url  │     └──────────────────┘
//! │ id (PK)       │     │ created_at    │
//! │ queue / name  │     └───────┬───────┘     ┌──────────────────┐
//! │ payload_json  │             └─────────────│ analysis_results │
//! │ status        │                           │ run_id (UQ)      │
//! │ attempts      │                           │ narrative fields │
//! │ locked_until  │                           │ detected_errors  │
//! │ run_after     │                           │ steps (JSON)     │
//! │ last_error    │                           └──────────────────┘
//! └───────────────┘
//! ```
//!
//! # Tables
//!
//! | Table | Purpose |
//! |-------|---------|
//! | `repositories` | Imported provider repositories |
//! | `runs` | Terminal-state CI runs, upserted by provider run id |
//! | `chunks` | Size-bounded log slices with nullable embedding BLOBs |
//! | `analysis_results` | One verdict per run, upserted by run id |
//! | `jobs` | At-least-once processing queue with lock leases |
//!
//! # Idempotency
//!
//! All statements use `CREATE TABLE IF NOT EXISTS` / `CREATE INDEX IF NOT
//! EXISTS`; running `triage init` multiple times is safe.

use anyhow::Result;
use sqlx::SqlitePool;

/// Run all database migrations against an open pool.
///
/// Safe to call multiple times. Foreign keys cascade so that deleting a
/// repository removes its runs, and deleting a run removes its chunks and
/// analysis result.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS repositories (
            id TEXT PRIMARY KEY,
            provider_id INTEGER NOT NULL UNIQUE,
            owner TEXT NOT NULL,
            name TEXT NOT NULL,
            private INTEGER NOT NULL DEFAULT 0,
            user_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            provider_run_id INTEGER NOT NULL UNIQUE,
            repo_id TEXT NOT NULL,
            workflow_name TEXT NOT NULL,
            status TEXT NOT NULL,
            trigger TEXT,
            commit_sha TEXT,
            branch TEXT,
            actor TEXT,
            provider_url TEXT,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (repo_id) REFERENCES repositories(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            step_name TEXT NOT NULL,
            content TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            line_count INTEGER NOT NULL,
            token_estimate INTEGER NOT NULL,
            has_errors INTEGER NOT NULL DEFAULT 0,
            error_count INTEGER NOT NULL DEFAULT 0,
            embedding BLOB,
            UNIQUE(run_id, chunk_index),
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_results (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL UNIQUE,
            root_cause TEXT NOT NULL,
            failure_stage TEXT NOT NULL,
            suggested_fix TEXT NOT NULL,
            failure_type TEXT NOT NULL,
            priority INTEGER NOT NULL,
            confidence REAL NOT NULL,
            used_llm INTEGER NOT NULL DEFAULT 0,
            detected_errors TEXT NOT NULL DEFAULT '[]',
            steps TEXT NOT NULL DEFAULT '[]',
            created_at INTEGER NOT NULL,
            FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            queue TEXT NOT NULL,
            name TEXT NOT NULL,
            payload TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            locked_until INTEGER,
            run_after INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Indexes for the hot paths: chunk lookup per run, embedding candidate
    // scans, analysis join, and queue polling.
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_run_id ON chunks(run_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_embedded ON chunks(run_id) WHERE embedding IS NOT NULL",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_repo_id ON runs(repo_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_jobs_poll ON jobs(queue, status, run_after, created_at)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
