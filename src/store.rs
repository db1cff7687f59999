//! Persistence operations over the SQLite store.
//!
//! All writes follow the same discipline: upserts keyed on the natural
//! unique column (`provider_id`, `provider_run_id`, `run_id`), and the
//! chunk set of a run replaced atomically inside one transaction with
//! deletion first, so a retried job can never duplicate chunks.

use anyhow::Result;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::embedder::{blob_to_vec, vec_to_blob};
use crate::models::{
    AnalysisResult, Chunk, EmbeddingStats, Repository, Run, RunStatus,
};

/// Insert or update a repository by provider id; returns its UUID.
pub async fn upsert_repository(pool: &SqlitePool, repo: &Repository) -> Result<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM repositories WHERE provider_id = ?")
            .bind(repo.provider_id)
            .fetch_optional(pool)
            .await?;

    let id = existing.unwrap_or_else(|| repo.id.clone());

    sqlx::query(
        r#"
        INSERT INTO repositories (id, provider_id, owner, name, private, user_id)
        VALUES (?, ?, ?, ?, ?, ?)
        ON CONFLICT(provider_id) DO UPDATE SET
            owner = excluded.owner,
            name = excluded.name,
            private = excluded.private,
            user_id = excluded.user_id
        "#,
    )
    .bind(&id)
    .bind(repo.provider_id)
    .bind(&repo.owner)
    .bind(&repo.name)
    .bind(repo.private as i64)
    .bind(&repo.user_id)
    .execute(pool)
    .await?;

    Ok(id)
}

/// Insert or update a run by provider run id; returns its UUID.
///
/// Status is terminal once set, so the upsert keeps metadata fresh but is
/// harmless when the same webhook is delivered twice.
pub async fn upsert_run(pool: &SqlitePool, run: &Run) -> Result<String> {
    let existing: Option<String> =
        sqlx::query_scalar("SELECT id FROM runs WHERE provider_run_id = ?")
            .bind(run.provider_run_id)
            .fetch_optional(pool)
            .await?;

    let id = existing.unwrap_or_else(|| run.id.clone());

    sqlx::query(
        r#"
        INSERT INTO runs (id, provider_run_id, repo_id, workflow_name, status, trigger,
                          commit_sha, branch, actor, provider_url, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(provider_run_id) DO UPDATE SET
            workflow_name = excluded.workflow_name,
            status = excluded.status,
            trigger = excluded.trigger,
            commit_sha = excluded.commit_sha,
            branch = excluded.branch,
            actor = excluded.actor,
            provider_url = excluded.provider_url
        "#,
    )
    .bind(&id)
    .bind(run.provider_run_id)
    .bind(&run.repo_id)
    .bind(&run.workflow_name)
    .bind(run.status.as_str())
    .bind(&run.trigger)
    .bind(&run.commit_sha)
    .bind(&run.branch)
    .bind(&run.actor)
    .bind(&run.provider_url)
    .bind(run.created_at)
    .execute(pool)
    .await?;

    Ok(id)
}

pub async fn get_run(pool: &SqlitePool, run_id: &str) -> Result<Option<Run>> {
    let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| run_from_row(&r)))
}

pub async fn get_run_by_provider_id(
    pool: &SqlitePool,
    provider_run_id: i64,
) -> Result<Option<Run>> {
    let row = sqlx::query("SELECT * FROM runs WHERE provider_run_id = ?")
        .bind(provider_run_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|r| run_from_row(&r)))
}

fn run_from_row(row: &sqlx::sqlite::SqliteRow) -> Run {
    let status: String = row.get("status");
    Run {
        id: row.get("id"),
        provider_run_id: row.get("provider_run_id"),
        repo_id: row.get("repo_id"),
        workflow_name: row.get("workflow_name"),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failure),
        trigger: row.get("trigger"),
        commit_sha: row.get("commit_sha"),
        branch: row.get("branch"),
        actor: row.get("actor"),
        provider_url: row.get("provider_url"),
        created_at: row.get("created_at"),
    }
}

/// Atomically replace all chunks of a run.
///
/// Deletion happens first inside the transaction, so re-running a job after
/// a mid-pipeline failure is safe: the second execution starts from a clean
/// slate. Embeddings are persisted as NULL here and filled later.
pub async fn replace_chunks(pool: &SqlitePool, run_id: &str, chunks: &[Chunk]) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM chunks WHERE run_id = ?")
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            r#"
            INSERT INTO chunks (id, run_id, chunk_index, step_name, content, start_line,
                                end_line, line_count, token_estimate, has_errors, error_count,
                                embedding)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)
            "#,
        )
        .bind(&chunk.id)
        .bind(run_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.step_name)
        .bind(&chunk.content)
        .bind(chunk.start_line)
        .bind(chunk.end_line)
        .bind(chunk.line_count)
        .bind(chunk.token_estimate)
        .bind(chunk.has_errors as i64)
        .bind(chunk.error_count)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// All chunks of a run in index order.
pub async fn get_chunks(pool: &SqlitePool, run_id: &str) -> Result<Vec<Chunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE run_id = ? ORDER BY chunk_index")
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    Ok(rows.iter().map(chunk_from_row).collect())
}

pub fn chunk_from_row(row: &sqlx::sqlite::SqliteRow) -> Chunk {
    let embedding: Option<Vec<u8>> = row.get("embedding");
    Chunk {
        id: row.get("id"),
        run_id: row.get("run_id"),
        chunk_index: row.get("chunk_index"),
        step_name: row.get("step_name"),
        content: row.get("content"),
        start_line: row.get("start_line"),
        end_line: row.get("end_line"),
        line_count: row.get("line_count"),
        token_estimate: row.get("token_estimate"),
        has_errors: row.get::<i64, _>("has_errors") != 0,
        error_count: row.get("error_count"),
        embedding: embedding.map(|b| blob_to_vec(&b)),
    }
}

/// Store (or overwrite) a chunk's embedding vector. Idempotent: writing
/// the same vector twice leaves the same column value.
pub async fn update_chunk_embedding(
    pool: &SqlitePool,
    chunk_id: &str,
    vector: &[f32],
) -> Result<()> {
    sqlx::query("UPDATE chunks SET embedding = ? WHERE id = ?")
        .bind(vec_to_blob(vector))
        .bind(chunk_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Chunks of a run that still lack an embedding, in index order.
pub async fn chunks_without_embeddings(
    pool: &SqlitePool,
    run_id: Option<&str>,
    limit: Option<i64>,
) -> Result<Vec<Chunk>> {
    let limit = limit.unwrap_or(i64::MAX);
    let rows = match run_id {
        Some(id) => {
            sqlx::query(
                "SELECT * FROM chunks WHERE run_id = ? AND embedding IS NULL \
                 ORDER BY chunk_index LIMIT ?",
            )
            .bind(id)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query(
                "SELECT * FROM chunks WHERE embedding IS NULL \
                 ORDER BY run_id, chunk_index LIMIT ?",
            )
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(rows.iter().map(chunk_from_row).collect())
}

/// Insert or update the analysis result of a run (exactly one per run).
pub async fn upsert_analysis(pool: &SqlitePool, result: &AnalysisResult) -> Result<()> {
    let detected_errors = serde_json::to_string(&result.detected_errors)?;
    let steps = serde_json::to_string(&result.steps)?;

    sqlx::query(
        r#"
        INSERT INTO analysis_results (id, run_id, root_cause, failure_stage, suggested_fix,
                                      failure_type, priority, confidence, used_llm,
                                      detected_errors, steps, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(run_id) DO UPDATE SET
            root_cause = excluded.root_cause,
            failure_stage = excluded.failure_stage,
            suggested_fix = excluded.suggested_fix,
            failure_type = excluded.failure_type,
            priority = excluded.priority,
            confidence = excluded.confidence,
            used_llm = excluded.used_llm,
            detected_errors = excluded.detected_errors,
            steps = excluded.steps,
            created_at = excluded.created_at
        "#,
    )
    .bind(&result.id)
    .bind(&result.run_id)
    .bind(&result.root_cause)
    .bind(&result.failure_stage)
    .bind(&result.suggested_fix)
    .bind(&result.failure_type)
    .bind(result.priority)
    .bind(result.confidence)
    .bind(result.used_llm as i64)
    .bind(detected_errors)
    .bind(steps)
    .bind(result.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_analysis(pool: &SqlitePool, run_id: &str) -> Result<Option<AnalysisResult>> {
    let row = sqlx::query("SELECT * FROM analysis_results WHERE run_id = ?")
        .bind(run_id)
        .fetch_optional(pool)
        .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let detected_errors: String = row.get("detected_errors");
    let steps: String = row.get("steps");

    Ok(Some(AnalysisResult {
        id: row.get("id"),
        run_id: row.get("run_id"),
        root_cause: row.get("root_cause"),
        failure_stage: row.get("failure_stage"),
        suggested_fix: row.get("suggested_fix"),
        failure_type: row.get("failure_type"),
        priority: row.get("priority"),
        confidence: row.get("confidence"),
        used_llm: row.get::<i64, _>("used_llm") != 0,
        detected_errors: serde_json::from_str(&detected_errors).unwrap_or_default(),
        steps: serde_json::from_str(&steps).unwrap_or_default(),
        created_at: row.get("created_at"),
    }))
}

/// Embedding coverage across all chunks.
pub async fn embedding_stats(pool: &SqlitePool) -> Result<EmbeddingStats> {
    let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;
    let with_embeddings: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
            .fetch_one(pool)
            .await?;

    let percent_complete = if total > 0 {
        (with_embeddings as f64 / total as f64) * 100.0
    } else {
        0.0
    };

    Ok(EmbeddingStats {
        total,
        with_embeddings,
        without_embeddings: total - with_embeddings,
        percent_complete,
    })
}

/// Build a fresh [`Run`] value for webhook/enqueue paths.
pub fn new_run(
    provider_run_id: i64,
    repo_id: &str,
    workflow_name: &str,
    status: RunStatus,
    created_at: i64,
) -> Run {
    Run {
        id: Uuid::new_v4().to_string(),
        provider_run_id,
        repo_id: repo_id.to_string(),
        workflow_name: workflow_name.to_string(),
        status,
        trigger: None,
        commit_sha: None,
        branch: None,
        actor: None,
        provider_url: None,
        created_at,
    }
}
