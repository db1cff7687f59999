//! Cosine-similarity retrieval over chunk embeddings.
//!
//! Every query filters out rows whose embedding is NULL, decodes the
//! remaining candidates, and scores them in process with
//! [`cosine_similarity`]. Similarity is `1 − cosine_distance`: results are
//! ordered by ascending distance (descending similarity) and cut off at
//! the caller's minimum. RAG admission uses 0.6, general search 0.7.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::embedder::{blob_to_vec, cosine_similarity};
use crate::models::{Chunk, SimilarCase};
use crate::store::chunk_from_row;

/// Characters of chunk content carried into prompts and search output.
const EXCERPT_MAX_CHARS: usize = 500;

/// A chunk scored against a query vector.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub similarity: f64,
}

/// Up to `limit` embedded chunks with similarity ≥ `min_sim`.
pub async fn find_similar_chunks(
    pool: &SqlitePool,
    query_vec: &[f32],
    limit: i64,
    min_sim: f64,
) -> Result<Vec<ScoredChunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE embedding IS NOT NULL")
        .fetch_all(pool)
        .await?;
    Ok(score_rows(rows.iter().map(chunk_from_row), query_vec, limit, min_sim))
}

/// Same as [`find_similar_chunks`], restricted to error-bearing chunks.
pub async fn find_similar_errors(
    pool: &SqlitePool,
    query_vec: &[f32],
    limit: i64,
    min_sim: f64,
) -> Result<Vec<ScoredChunk>> {
    let rows =
        sqlx::query("SELECT * FROM chunks WHERE embedding IS NOT NULL AND has_errors = 1")
            .fetch_all(pool)
            .await?;
    Ok(score_rows(rows.iter().map(chunk_from_row), query_vec, limit, min_sim))
}

/// Chunks of a single run scored against the query vector; used for
/// per-run conversational retrieval.
pub async fn find_relevant_chunks_for_run(
    pool: &SqlitePool,
    run_id: &str,
    query_vec: &[f32],
    limit: i64,
) -> Result<Vec<ScoredChunk>> {
    let rows = sqlx::query("SELECT * FROM chunks WHERE embedding IS NOT NULL AND run_id = ?")
        .bind(run_id)
        .fetch_all(pool)
        .await?;
    Ok(score_rows(rows.iter().map(chunk_from_row), query_vec, limit, 0.0))
}

fn score_rows(
    chunks: impl Iterator<Item = Chunk>,
    query_vec: &[f32],
    limit: i64,
    min_sim: f64,
) -> Vec<ScoredChunk> {
    let mut scored: Vec<ScoredChunk> = chunks
        .filter_map(|chunk| {
            let embedding = chunk.embedding.as_ref()?;
            let similarity = cosine_similarity(embedding, query_vec) as f64;
            if similarity >= min_sim {
                Some(ScoredChunk { chunk, similarity })
            } else {
                None
            }
        })
        .collect();

    scored.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    scored.truncate(limit.max(0) as usize);
    scored
}

/// Candidate chunks joined to their run's analysis (nullable).
///
/// Rows whose run was never analyzed are still returned, with the analysis
/// fields unset, so RAG can decide what counts as a usable case.
pub async fn find_similar_with_analysis(
    pool: &SqlitePool,
    query_vec: &[f32],
    limit: i64,
) -> Result<Vec<SimilarCase>> {
    let rows = sqlx::query(
        r#"
        SELECT c.id AS chunk_id, c.run_id, c.step_name, c.content, c.embedding,
               r.workflow_name, r.branch,
               a.root_cause, a.suggested_fix
        FROM chunks c
        JOIN runs r ON r.id = c.run_id
        LEFT JOIN analysis_results a ON a.run_id = c.run_id
        WHERE c.embedding IS NOT NULL
        "#,
    )
    .fetch_all(pool)
    .await?;

    let mut cases: Vec<SimilarCase> = rows
        .iter()
        .map(|row| {
            let blob: Vec<u8> = row.get("embedding");
            let embedding = blob_to_vec(&blob);
            let content: String = row.get("content");
            SimilarCase {
                chunk_id: row.get("chunk_id"),
                run_id: row.get("run_id"),
                step_name: row.get("step_name"),
                excerpt: truncate_chars(&content, EXCERPT_MAX_CHARS),
                similarity: cosine_similarity(&embedding, query_vec) as f64,
                workflow_name: row.get("workflow_name"),
                branch: row.get("branch"),
                root_cause: row.get("root_cause"),
                suggested_fix: row.get("suggested_fix"),
            }
        })
        .collect();

    cases.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    cases.truncate(limit.max(0) as usize);
    Ok(cases)
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}
