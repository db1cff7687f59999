use anyhow::{bail, Result};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::Config;
use crate::embedder;
use crate::store;

/// Backfill embeddings for chunks that are missing them.
///
/// Per-chunk best effort with the configured inter-call delay, same as the
/// inline pass the pipeline runs — this command exists for chunks left
/// behind by provider outages.
pub async fn run_embed_pending(
    pool: &SqlitePool,
    config: &Config,
    limit: Option<i64>,
    dry_run: bool,
) -> Result<()> {
    if !config.embedding.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }

    let pending = store::chunks_without_embeddings(pool, None, limit).await?;

    if dry_run {
        println!("embed pending (dry-run)");
        println!("  chunks needing embeddings: {}", pending.len());
        return Ok(());
    }

    if pending.is_empty() {
        println!("embed pending");
        println!("  all chunks up to date");
        return Ok(());
    }

    let total = pending.len();
    let mut embedded = 0u64;
    let mut failed = 0u64;

    for (i, chunk) in pending.iter().enumerate() {
        if i > 0 && config.embedding.inter_call_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.embedding.inter_call_delay_ms)).await;
        }

        match embedder::embed_text(&config.embedding, &chunk.content).await {
            Ok(vector) => {
                store::update_chunk_embedding(pool, &chunk.id, &vector).await?;
                embedded += 1;
            }
            Err(e) => {
                eprintln!(
                    "Warning: embedding failed for chunk {} of run {}: {}",
                    chunk.chunk_index, chunk.run_id, e
                );
                failed += 1;
            }
        }
    }

    println!("embed pending");
    println!("  total pending: {}", total);
    println!("  embedded: {}", embedded);
    println!("  failed: {}", failed);

    Ok(())
}
