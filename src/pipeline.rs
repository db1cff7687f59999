//! End-to-end pipeline orchestration for a single run.
//!
//! The pure stages (clean → detect steps → chunk → extract errors) are
//! bundled in [`parse_log`] so the synchronous `/analyze` surface and the
//! worker share one code path. [`process_run`] adds the stateful stages in
//! their required order: chunks are fully persisted before embedding
//! begins, every per-chunk embedding attempt settles before
//! classification, and the AnalysisResult upsert is the last write.

use anyhow::{bail, Result};
use sqlx::SqlitePool;

use crate::chunker::chunk_steps;
use crate::cleaner::clean;
use crate::config::Config;
use crate::embedder;
use crate::models::{AnalysisResult, Chunk, DetectedError, LogStep};
use crate::patterns::extract_errors;
use crate::steps::detect_steps;
use crate::{analyzer, store};

/// Everything the pure stages produce for one log.
pub struct ParsedLog {
    pub lines: Vec<String>,
    pub steps: Vec<LogStep>,
    pub chunks: Vec<Chunk>,
    pub errors: Vec<DetectedError>,
}

/// Run the pure transformation stages on raw log text.
///
/// Fails terminally on an empty log (nothing to chunk, nothing to
/// analyze); every other input produces at least one chunk.
pub fn parse_log(config: &Config, run_id: &str, raw: &str) -> Result<ParsedLog> {
    let lines = clean(raw);
    if lines.is_empty() {
        bail!("empty log: no content after cleaning");
    }

    let steps = detect_steps(&lines);
    let mut chunks = chunk_steps(
        run_id,
        &lines,
        &steps,
        config.pipeline.max_chunk_lines,
        config.pipeline.tokens_per_char,
    );
    let errors = extract_errors(&mut chunks);

    Ok(ParsedLog {
        lines,
        steps,
        chunks,
        errors,
    })
}

/// Process one run end-to-end: parse, persist, embed, analyze.
///
/// Idempotent under retry: chunk replacement deletes first, and the
/// analysis upsert is keyed by run id. Embedding is best-effort and never
/// fails the job.
pub async fn process_run(
    pool: &SqlitePool,
    config: &Config,
    run_id: &str,
    raw: &str,
) -> Result<AnalysisResult> {
    let parsed = parse_log(config, run_id, raw)?;

    store::replace_chunks(pool, run_id, &parsed.chunks).await?;

    let outcome = embedder::embed_run_chunks(&config.embedding, pool, &parsed.chunks).await;
    if outcome.failed > 0 && config.embedding.is_enabled() {
        eprintln!(
            "Warning: {} of {} chunks failed to embed for run {}",
            outcome.failed,
            parsed.chunks.len(),
            run_id
        );
    }

    let now = chrono::Utc::now().timestamp();
    analyzer::analyze_run(
        pool,
        config,
        run_id,
        &parsed.chunks,
        &parsed.errors,
        &parsed.steps,
        now,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn test_empty_log_is_terminal() {
        let config = Config::minimal();
        assert!(parse_log(&config, "run1", "").is_err());
        assert!(parse_log(&config, "run1", "\n\n  \n").is_err());
    }

    #[test]
    fn test_parse_produces_dense_indices_and_errors() {
        let config = Config::minimal();
        let raw = "##[group]Install\nnpm ERR! Cannot find module 'react'\n##[endgroup]\n##[group]Summary\ndone\n##[endgroup]";
        let parsed = parse_log(&config, "run1", raw).unwrap();

        assert_eq!(parsed.steps.len(), 2);
        for (i, c) in parsed.chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i as i64);
        }
        assert_eq!(parsed.errors.len(), 1);
        assert_eq!(parsed.errors[0].category, "Dependency Issue");
        assert!(parsed.chunks[0].has_errors);
        assert!(!parsed.chunks[1].has_errors);
    }

    #[test]
    fn test_parse_no_markers_single_full_log_chunk() {
        let config = Config::minimal();
        let parsed = parse_log(&config, "run1", "just some lines\nanother").unwrap();
        assert_eq!(parsed.chunks.len(), 1);
        assert_eq!(parsed.chunks[0].step_name, "Full Log");
    }

    #[test]
    fn test_parse_deterministic_modulo_ids() {
        let config = Config::minimal();
        let raw = "Run npm test\nAssertionError: nope\n1 failing";
        let a = parse_log(&config, "run1", raw).unwrap();
        let b = parse_log(&config, "run1", raw).unwrap();

        assert_eq!(a.lines, b.lines);
        assert_eq!(a.steps, b.steps);
        assert_eq!(a.chunks.len(), b.chunks.len());
        for (ca, cb) in a.chunks.iter().zip(b.chunks.iter()) {
            assert_eq!(ca.content, cb.content);
            assert_eq!(ca.step_name, cb.step_name);
            assert_eq!(ca.token_estimate, cb.token_estimate);
            assert_eq!(ca.error_count, cb.error_count);
        }
        assert_eq!(a.errors.len(), b.errors.len());
        for (ea, eb) in a.errors.iter().zip(b.errors.iter()) {
            assert_eq!(ea.category, eb.category);
            assert_eq!(ea.message, eb.message);
            assert_eq!(ea.evidence_lines, eb.evidence_lines);
        }
    }
}
