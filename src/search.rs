use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::embedder;
use crate::retrieval;

/// Run the `search` command: embed the query and print ranked chunks.
pub async fn run_search(
    pool: &SqlitePool,
    config: &Config,
    query: &str,
    limit: Option<i64>,
    min_similarity: Option<f64>,
    errors_only: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }
    if !config.embedding.is_enabled() {
        bail!("Semantic search requires an embedding provider. Set [embedding] provider in config.");
    }

    let limit = limit.unwrap_or(config.retrieval.default_limit);
    let min_sim = min_similarity.unwrap_or(config.retrieval.default_min_similarity);

    let query_vec = embedder::embed_text(&config.embedding, query).await?;
    let hits = if errors_only {
        retrieval::find_similar_errors(pool, &query_vec, limit, min_sim).await?
    } else {
        retrieval::find_similar_chunks(pool, &query_vec, limit, min_sim).await?
    };

    if hits.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for (i, hit) in hits.iter().enumerate() {
        let excerpt: String = hit
            .chunk
            .content
            .split('\n')
            .take(2)
            .collect::<Vec<_>>()
            .join(" ");
        println!(
            "{}. [{:.2}] {} (chunk {} of run {})",
            i + 1,
            hit.similarity,
            hit.chunk.step_name,
            hit.chunk.chunk_index,
            hit.chunk.run_id
        );
        println!("    lines {}-{}", hit.chunk.start_line, hit.chunk.end_line);
        if hit.chunk.has_errors {
            println!("    errors: {}", hit.chunk.error_count);
        }
        println!("    excerpt: \"{}\"", excerpt.trim());
        println!();
    }

    Ok(())
}
