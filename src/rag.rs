//! Retrieval-augmented generation support.
//!
//! When the classifier does not short-circuit, the analyzer retrieves
//! historically similar error chunks (with their resolved analyses) and
//! splices them into the prompt, so the narrative is grounded in prior
//! resolutions instead of speculation.
//!
//! The retrieval query is built from the strongest deterministic signals:
//! the top detected error messages plus the opening lines of the first
//! error-bearing chunk.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::{EmbeddingConfig, RagConfig};
use crate::embedder;
use crate::models::{Chunk, DetectedError, SimilarCase};
use crate::retrieval;

/// Error messages carried into the retrieval query.
const QUERY_MAX_ERRORS: usize = 5;
/// Leading lines of the first error chunk carried into the query.
const QUERY_CONTEXT_LINES: usize = 10;

/// Build the retrieval query text from detected errors and chunks.
pub fn build_query(errors: &[DetectedError], chunks: &[Chunk]) -> String {
    let mut parts: Vec<String> = errors
        .iter()
        .take(QUERY_MAX_ERRORS)
        .map(|e| e.message.clone())
        .collect();

    if let Some(chunk) = chunks.iter().find(|c| c.has_errors) {
        let head: Vec<&str> = chunk.content.split('\n').take(QUERY_CONTEXT_LINES).collect();
        parts.push(head.join("\n"));
    }

    parts.join("\n").trim().to_string()
}

/// Retrieve up to `rag.max_cases` similar cases above the admission
/// threshold. An empty query (no errors, no error chunks) yields no cases.
///
/// `exclude_run` keeps the run under analysis out of its own context: its
/// freshly embedded chunks would otherwise match themselves at similarity
/// 1.0 and crowd out genuinely historical cases, so candidates are
/// over-fetched before the exclusion and the final truncation.
pub async fn retrieve(
    pool: &SqlitePool,
    embedding: &EmbeddingConfig,
    rag: &RagConfig,
    query: &str,
    exclude_run: Option<&str>,
) -> Result<Vec<SimilarCase>> {
    if query.is_empty() || !embedding.is_enabled() {
        return Ok(Vec::new());
    }

    let query_vec = embedder::embed_text(embedding, query).await?;
    let cases =
        retrieval::find_similar_with_analysis(pool, &query_vec, rag.max_cases * 2 + 8).await?;

    let mut admitted: Vec<SimilarCase> = cases
        .into_iter()
        .filter(|c| c.similarity >= rag.min_similarity)
        .filter(|c| exclude_run != Some(c.run_id.as_str()))
        .collect();
    admitted.truncate(rag.max_cases.max(0) as usize);
    Ok(admitted)
}

/// Synthesize an analysis confidence from the retrieved case set.
///
/// Two or more matching cases raise confidence with the top similarity;
/// a single case caps at 0.75; no cases means the narrative rests on the
/// LLM alone (0.5).
pub fn synthesize_confidence(cases: &[SimilarCase]) -> f64 {
    let top = cases.first().map(|c| c.similarity).unwrap_or(0.0);

    if cases.len() >= 2 {
        if top >= 0.9 {
            return 0.95;
        }
        if top >= 0.8 {
            return 0.85;
        }
        if top >= 0.7 {
            return 0.75;
        }
        return 0.6;
    }
    if cases.is_empty() {
        0.5
    } else if top >= 0.7 {
        0.75
    } else {
        0.6
    }
}

/// Render the retrieved cases as a prompt section.
pub fn format_context(cases: &[SimilarCase]) -> String {
    if cases.is_empty() {
        return String::new();
    }

    let mut out = String::from("## Similar past failures\n");
    for (i, case) in cases.iter().enumerate() {
        out.push_str(&format!(
            "\n### Case {} (similarity {:.2}, workflow \"{}\"{})\n",
            i + 1,
            case.similarity,
            case.workflow_name,
            case.branch
                .as_deref()
                .map(|b| format!(", branch {}", b))
                .unwrap_or_default()
        ));
        out.push_str(&format!("Log excerpt:\n{}\n", case.excerpt));
        match (&case.root_cause, &case.suggested_fix) {
            (Some(cause), Some(fix)) => {
                out.push_str(&format!("Resolved root cause: {}\n", cause));
                out.push_str(&format!("Applied fix: {}\n", fix));
            }
            (Some(cause), None) => {
                out.push_str(&format!("Resolved root cause: {}\n", cause));
            }
            _ => {
                out.push_str("No prior analysis recorded for this case.\n");
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorConfidence;
    use uuid::Uuid;

    fn case(similarity: f64, cause: Option<&str>) -> SimilarCase {
        SimilarCase {
            chunk_id: Uuid::new_v4().to_string(),
            run_id: Uuid::new_v4().to_string(),
            step_name: "Install".to_string(),
            excerpt: "npm ERR! Cannot find module 'react'".to_string(),
            similarity,
            workflow_name: "CI".to_string(),
            branch: Some("main".to_string()),
            root_cause: cause.map(|s| s.to_string()),
            suggested_fix: cause.map(|_| "add the dependency".to_string()),
        }
    }

    fn error(message: &str) -> DetectedError {
        DetectedError {
            category: "Dependency Issue".to_string(),
            message: message.to_string(),
            confidence: ErrorConfidence::High,
            evidence_lines: vec![0],
            intentional: false,
            chunk_index: 0,
            step_name: "Install".to_string(),
        }
    }

    fn chunk(content: &str, has_errors: bool) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            run_id: "run1".to_string(),
            chunk_index: 0,
            step_name: "Install".to_string(),
            content: content.to_string(),
            start_line: 0,
            end_line: 0,
            line_count: 1,
            token_estimate: 1,
            has_errors,
            error_count: has_errors as i64,
            embedding: None,
        }
    }

    #[test]
    fn test_query_takes_top_five_errors() {
        let errors: Vec<DetectedError> =
            (0..8).map(|i| error(&format!("error number {}", i))).collect();
        let query = build_query(&errors, &[]);
        assert!(query.contains("error number 4"));
        assert!(!query.contains("error number 5"));
    }

    #[test]
    fn test_query_includes_first_error_chunk_head() {
        let lines: Vec<String> = (0..20).map(|i| format!("line {}", i)).collect();
        let chunks = vec![chunk("clean", false), chunk(&lines.join("\n"), true)];
        let query = build_query(&[error("boom")], &chunks);
        assert!(query.contains("boom"));
        assert!(query.contains("line 9"));
        assert!(!query.contains("line 10"));
    }

    #[test]
    fn test_query_empty_when_nothing_detected() {
        assert!(build_query(&[], &[chunk("clean", false)]).is_empty());
    }

    #[test]
    fn test_confidence_synthesis_tiers() {
        assert_eq!(synthesize_confidence(&[]), 0.5);
        assert_eq!(
            synthesize_confidence(&[case(0.95, Some("x")), case(0.8, Some("y"))]),
            0.95
        );
        assert_eq!(
            synthesize_confidence(&[case(0.85, Some("x")), case(0.7, Some("y"))]),
            0.85
        );
        assert_eq!(
            synthesize_confidence(&[case(0.75, Some("x")), case(0.7, Some("y"))]),
            0.75
        );
        assert_eq!(
            synthesize_confidence(&[case(0.65, Some("x")), case(0.62, Some("y"))]),
            0.6
        );
        assert_eq!(synthesize_confidence(&[case(0.72, Some("x"))]), 0.75);
    }

    #[test]
    fn test_context_formatting() {
        let text = format_context(&[case(0.91, Some("stale lockfile")), case(0.7, None)]);
        assert!(text.contains("Case 1 (similarity 0.91"));
        assert!(text.contains("stale lockfile"));
        assert!(text.contains("No prior analysis recorded"));
    }

    #[test]
    fn test_context_empty_for_no_cases() {
        assert!(format_context(&[]).is_empty());
    }
}
