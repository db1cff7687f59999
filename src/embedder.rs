//! Embedding generation for log chunks.
//!
//! Dispatches on the configured provider:
//! - **`openai`** — OpenAI-compatible `POST /v1/embeddings` with retry and backoff.
//! - **`ollama`** — a local Ollama instance's `/api/embed` endpoint.
//! - **`mock`** — deterministic hash-derived vectors; used by tests and
//!   offline development, no network calls.
//! - **`disabled`** — embedding requests return errors; the pipeline
//!   counts the chunks as pending.
//!
//! Also provides the vector utilities shared with retrieval:
//! [`cosine_similarity`], [`vec_to_blob`], and [`blob_to_vec`].
//!
//! # Best-effort contract
//!
//! [`embed_run_chunks`] is strictly per-chunk: one failed chunk never
//! aborts the rest. Failures are warned about and counted, and the
//! pipeline proceeds to classification regardless. A fixed inter-call
//! delay (default 100 ms) paces requests as soft rate-limiting.
//!
//! # Retry Strategy
//!
//! HTTP 429 and 5xx and network errors retry with exponential backoff
//! (1s, 2s, 4s, ... capped at 2^5); other 4xx fail immediately.

use anyhow::{bail, Result};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::models::Chunk;
use crate::store;

/// Outcome of a per-run embedding pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbedOutcome {
    pub embedded: u64,
    pub failed: u64,
}

/// Collapse whitespace runs to single spaces and truncate to `max_chars`.
/// Returns the prepared text and whether truncation occurred.
pub fn prepare_input(text: &str, max_chars: usize) -> (String, bool) {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > max_chars {
        (collapsed.chars().take(max_chars).collect(), true)
    } else {
        (collapsed, false)
    }
}

/// Embed a single text using the configured provider.
pub async fn embed_text(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let (prepared, truncated) = prepare_input(text, config.max_chars);
    if truncated {
        eprintln!(
            "Warning: embedding input truncated to {} chars",
            config.max_chars
        );
    }

    let vector = match config.provider.as_str() {
        "openai" => embed_openai(config, &prepared).await?,
        "ollama" => embed_ollama(config, &prepared).await?,
        "mock" => mock_vector(&prepared, config.dim),
        "disabled" => bail!("Embedding provider is disabled"),
        other => bail!("Unknown embedding provider: {}", other),
    };

    if vector.len() != config.dim {
        eprintln!(
            "Warning: provider returned {}-dim embedding, expected {}",
            vector.len(),
            config.dim
        );
    }

    Ok(vector)
}

/// Embed every chunk of a run, best-effort, updating the stored rows.
///
/// Chunks are processed in index order with a fixed delay between provider
/// calls. Per-chunk failures are warned about and counted; they are never
/// rethrown.
pub async fn embed_run_chunks(
    config: &EmbeddingConfig,
    pool: &SqlitePool,
    chunks: &[Chunk],
) -> EmbedOutcome {
    if !config.is_enabled() {
        return EmbedOutcome {
            embedded: 0,
            failed: chunks.len() as u64,
        };
    }

    let mut outcome = EmbedOutcome::default();

    for (i, chunk) in chunks.iter().enumerate() {
        if i > 0 && config.inter_call_delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.inter_call_delay_ms)).await;
        }

        match embed_text(config, &chunk.content).await {
            Ok(vector) => match store::update_chunk_embedding(pool, &chunk.id, &vector).await {
                Ok(()) => outcome.embedded += 1,
                Err(e) => {
                    eprintln!(
                        "Warning: failed to store embedding for chunk {}: {}",
                        chunk.chunk_index, e
                    );
                    outcome.failed += 1;
                }
            },
            Err(e) => {
                eprintln!(
                    "Warning: embedding failed for chunk {}: {}",
                    chunk.chunk_index, e
                );
                outcome.failed += 1;
            }
        }
    }

    outcome
}

async fn embed_openai(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for openai provider"))?;
    let url = config
        .url
        .as_deref()
        .unwrap_or("https://api.openai.com/v1/embeddings");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "input": [text],
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_openai_embedding(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("embedding API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("embedding API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
}

fn parse_openai_embedding(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid embedding response: missing data[0].embedding"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

async fn embed_ollama(config: &EmbeddingConfig, text: &str) -> Result<Vec<f32>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("embedding.model required for ollama provider"))?;
    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "input": [text],
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/api/embed", url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return parse_ollama_embedding(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("Ollama API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    url,
                    e
                ));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama embedding failed after retries")))
}

fn parse_ollama_embedding(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .and_then(|e| e.first())
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid Ollama response: missing embeddings[0]"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Deterministic unit-length vector built with the hashing trick: each
/// whitespace token lands in a SHA-256-derived bucket with a hashed sign.
/// Identical inputs embed identically and texts sharing most tokens embed
/// similarly, which is what tests and offline development need.
pub fn mock_vector(text: &str, dim: usize) -> Vec<f32> {
    let mut vector = vec![0.0f32; dim];
    if dim == 0 {
        return vector;
    }

    for token in text.split_whitespace() {
        let digest = Sha256::digest(token.to_lowercase().as_bytes());
        let mut bucket_bytes = [0u8; 8];
        bucket_bytes.copy_from_slice(&digest[..8]);
        let bucket = (u64::from_le_bytes(bucket_bytes) % dim as u64) as usize;
        let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
        vector[bucket] += sign;
    }

    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut vector {
            *v /= norm;
        }
    }
    vector
}

/// Pack a vector into the embedding column format: each component as four
/// little-endian bytes, in order.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Unpack an embedding column back into components. A trailing fragment
/// shorter than four bytes is ignored rather than treated as a component.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|word| {
            let mut le = [0u8; 4];
            le.copy_from_slice(word);
            f32::from_le_bytes(le)
        })
        .collect()
}

/// Cosine similarity between two vectors, in `[-1.0, 1.0]`. Empty input,
/// mismatched lengths, and zero-magnitude vectors all score `0.0` so
/// degenerate rows sort below every real match.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }

    let (dot, mag_a, mag_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, ma, mb), (&x, &y)| {
            (dot + x * y, ma + x * x, mb + y * y)
        });

    let magnitude = (mag_a * mag_b).sqrt();
    if magnitude <= f32::EPSILON {
        return 0.0;
    }
    dot / magnitude
}
