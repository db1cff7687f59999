//! Database statistics and health overview.
//!
//! A quick summary of what's ingested: run and chunk counts, embedding
//! coverage, analysis provenance, and queue state. Used by `triage stats`
//! to confirm that workers and embeddings are keeping up.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::queue::{self, LOG_PROCESSING};
use crate::store;

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(pool: &SqlitePool, config: &Config) -> Result<()> {
    let total_repos: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM repositories")
        .fetch_one(pool)
        .await?;
    let total_runs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs")
        .fetch_one(pool)
        .await?;
    let total_analyses: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM analysis_results")
        .fetch_one(pool)
        .await?;
    let llm_analyses: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM analysis_results WHERE used_llm = 1")
            .fetch_one(pool)
            .await?;

    let embeddings = store::embedding_stats(pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("CI Triage — Database Stats");
    println!("==========================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Repositories: {}", total_repos);
    println!("  Runs:         {}", total_runs);
    println!(
        "  Analyses:     {} ({} via LLM, {} deterministic)",
        total_analyses,
        llm_analyses,
        total_analyses - llm_analyses
    );
    println!(
        "  Embedded:     {} / {} chunks ({:.0}%)",
        embeddings.with_embeddings, embeddings.total, embeddings.percent_complete
    );

    let job_counts = queue::counts(pool, LOG_PROCESSING).await?;
    if !job_counts.is_empty() {
        println!();
        println!("  Queue '{}':", LOG_PROCESSING);
        for (status, count) in &job_counts {
            println!("    {:<10} {}", status, count);
        }
    }

    // Per-failure-type breakdown of analyzed runs.
    let type_rows = sqlx::query(
        r#"
        SELECT failure_type, COUNT(*) AS n
        FROM analysis_results
        GROUP BY failure_type
        ORDER BY n DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    if !type_rows.is_empty() {
        println!();
        println!("  By failure type:");
        for row in &type_rows {
            println!(
                "    {:<14} {}",
                row.get::<String, _>("failure_type"),
                row.get::<i64, _>("n")
            );
        }
    }

    println!();
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
