//! Prompt assembly for the analysis and fallback-classification calls.
//!
//! The grounding rules live in the prompt text, not in code: detected
//! errors are authoritative over raw log text, the classifier's priority
//! hierarchy is binding, and retrieved context beats speculation but loses
//! to detected errors on conflict.

use crate::models::{Chunk, Classification, DetectedError};

/// Trailing lines of each selected chunk included in the prompt.
const PROMPT_TAIL_LINES: usize = 30;

/// Select the chunks worth showing the model: every error-bearing chunk
/// plus the last two (final status and summary), deduplicated by index.
pub fn select_prompt_chunks(chunks: &[Chunk]) -> Vec<&Chunk> {
    let mut selected: Vec<&Chunk> = chunks.iter().filter(|c| c.has_errors).collect();

    let tail_start = chunks.len().saturating_sub(2);
    for chunk in &chunks[tail_start..] {
        if !selected.iter().any(|c| c.chunk_index == chunk.chunk_index) {
            selected.push(chunk);
        }
    }

    selected.sort_by_key(|c| c.chunk_index);
    selected
}

/// Build the analysis prompt: detected errors, the priority rules, the
/// current classification, the tail of each selected step, and (when
/// non-empty) the retrieved similar-case context.
pub fn build_analysis_prompt(
    classification: &Classification,
    errors: &[DetectedError],
    chunks: &[Chunk],
    rag_context: &str,
) -> String {
    let mut prompt = String::from(
        "You are a CI failure analyst. Determine the root cause of this failed \
         CI run.\n\n\
         Grounding rules, in order of authority:\n\
         1. The detected error signals below were extracted deterministically \
         and are authoritative; they outrank anything in the raw log text.\n\
         2. Respect the failure priority hierarchy (lower number = more severe): \
         TEST=1, BUILD=2, RUNTIME=3, INFRA=4, SECURITY=5, TIMEOUT=6, \
         DEPENDENCY=7, CONFIG=8, PERMISSION=9, LINT=10. Never name a \
         lower-priority issue as the root cause while a higher-priority issue \
         is present.\n\
         3. Prefer the similar past failures (when given) over speculation, \
         but the detected errors win on any conflict.\n\n",
    );

    prompt.push_str("## Detected errors\n");
    if errors.is_empty() {
        prompt.push_str("(none — classification fell through to UNKNOWN)\n");
    } else {
        for e in errors {
            prompt.push_str(&format!(
                "- [{}] {} (confidence: {:?}, step: {})\n",
                e.category, e.message, e.confidence, e.step_name
            ));
        }
    }

    prompt.push_str(&format!(
        "\n## Current classification\n{} (priority {}), confidence {:.2}: {}\n",
        classification.failure_type.as_str(),
        classification.priority,
        classification.confidence,
        classification.reason
    ));

    prompt.push_str("\n## Log tail per step\n");
    for chunk in select_prompt_chunks(chunks) {
        let lines: Vec<&str> = chunk.content.split('\n').collect();
        let tail_start = lines.len().saturating_sub(PROMPT_TAIL_LINES);
        prompt.push_str(&format!("\n### {}\n", chunk.step_name));
        prompt.push_str(&lines[tail_start..].join("\n"));
        prompt.push('\n');
    }

    if !rag_context.is_empty() {
        prompt.push('\n');
        prompt.push_str(rag_context);
    }

    prompt.push_str(
        "\nRespond with a single JSON object with exactly these keys: \
         \"rootCause\", \"failureStage\", \"suggestedFix\". No other text.\n",
    );

    prompt
}

/// Build the strict-schema prompt used when the deterministic classifier
/// returned UNKNOWN and the model is asked to categorize the failure.
pub fn build_classification_prompt(errors: &[DetectedError], chunks: &[Chunk]) -> String {
    let mut prompt = String::from(
        "Classify this CI failure into one of the following categories: \
         TEST, BUILD, RUNTIME, INFRA, SECURITY, TIMEOUT, DEPENDENCY, CONFIG, \
         PERMISSION, LINT. If none fits, propose a short new category name.\n\n",
    );

    if !errors.is_empty() {
        prompt.push_str("Detected errors:\n");
        for e in errors {
            prompt.push_str(&format!("- [{}] {}\n", e.category, e.message));
        }
        prompt.push('\n');
    }

    prompt.push_str("Log tail:\n");
    for chunk in select_prompt_chunks(chunks) {
        let lines: Vec<&str> = chunk.content.split('\n').collect();
        let tail_start = lines.len().saturating_sub(PROMPT_TAIL_LINES);
        prompt.push_str(&lines[tail_start..].join("\n"));
        prompt.push('\n');
    }

    prompt.push_str(
        "\nRespond with a single JSON object with exactly one key: \
         \"category\". No other text.\n",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorConfidence, FailureType};
    use uuid::Uuid;

    fn chunk(index: i64, step: &str, content: &str, has_errors: bool) -> Chunk {
        Chunk {
            id: Uuid::new_v4().to_string(),
            run_id: "run1".to_string(),
            chunk_index: index,
            step_name: step.to_string(),
            content: content.to_string(),
            start_line: 0,
            end_line: 0,
            line_count: content.split('\n').count() as i64,
            token_estimate: 1,
            has_errors,
            error_count: has_errors as i64,
            embedding: None,
        }
    }

    fn classification() -> Classification {
        Classification {
            failure_type: FailureType::Test,
            priority: 1,
            confidence: 0.7,
            reason: "2 test failure(s) detected".to_string(),
            skip_llm: false,
            narrative: None,
        }
    }

    #[test]
    fn test_selection_error_chunks_plus_last_two_deduped() {
        let chunks = vec![
            chunk(0, "Setup", "ok", false),
            chunk(1, "Test", "AssertionError", true),
            chunk(2, "Teardown", "bye", false),
            chunk(3, "Summary", "1 failed", true),
        ];
        let selected = select_prompt_chunks(&chunks);
        let indices: Vec<i64> = selected.iter().map(|c| c.chunk_index).collect();
        // Error chunks 1 and 3, plus last-two 2 and 3 (3 deduped).
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn test_prompt_contains_rules_errors_and_classification() {
        let chunks = vec![chunk(0, "Test", "AssertionError: nope", true)];
        let errors = vec![DetectedError {
            category: "Test Failure".to_string(),
            message: "AssertionError: nope".to_string(),
            confidence: ErrorConfidence::High,
            evidence_lines: vec![0],
            intentional: false,
            chunk_index: 0,
            step_name: "Test".to_string(),
        }];
        let prompt = build_analysis_prompt(&classification(), &errors, &chunks, "");
        assert!(prompt.contains("Never name a"));
        assert!(prompt.contains("[Test Failure] AssertionError: nope"));
        assert!(prompt.contains("TEST (priority 1)"));
        assert!(prompt.contains("\"rootCause\", \"failureStage\", \"suggestedFix\""));
    }

    #[test]
    fn test_prompt_keeps_only_last_thirty_lines() {
        let content: String = (0..40)
            .map(|i| format!("line {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = vec![chunk(0, "Big", &content, true)];
        let prompt = build_analysis_prompt(&classification(), &[], &chunks, "");
        assert!(!prompt.contains("line 9\n"));
        assert!(prompt.contains("line 10"));
        assert!(prompt.contains("line 39"));
    }

    #[test]
    fn test_rag_context_spliced() {
        let chunks = vec![chunk(0, "Test", "x", true)];
        let prompt =
            build_analysis_prompt(&classification(), &[], &chunks, "## Similar past failures\n...");
        assert!(prompt.contains("## Similar past failures"));
    }

    #[test]
    fn test_classification_prompt_shape() {
        let chunks = vec![chunk(0, "Odd", "0xDEAD fault", false)];
        let prompt = build_classification_prompt(&[], &chunks);
        assert!(prompt.contains("\"category\""));
        assert!(prompt.contains("TEST, BUILD, RUNTIME"));
    }
}
