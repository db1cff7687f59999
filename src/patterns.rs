//! Error pattern catalogue and line-level extraction.
//!
//! The catalogue is an ordered list of `{category, regex, confidence}`
//! records compiled once at first use. Ordering is load-bearing: each line
//! is tagged by the **first** matching pattern, so a line that matches both
//! `Dependency Issue` and a later family keeps the earlier tag. The
//! catalogue is data, not control flow, which keeps first-match-wins
//! deterministic and the set swappable without touching the extractor.
//!
//! Within a chunk, hits are deduplicated by `(category, message)`; repeat
//! occurrences accumulate into the first hit's evidence lines.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

use crate::models::{Chunk, DetectedError, ErrorConfidence};

/// One catalogue entry. `intentional` marks deliberate-failure patterns
/// (`exit 1` fixtures) so the classifier can short-circuit on them.
pub struct ErrorPattern {
    pub category: &'static str,
    pub regex: Regex,
    pub confidence: ErrorConfidence,
    pub intentional: bool,
}

fn pat(category: &'static str, re: &str, confidence: ErrorConfidence) -> ErrorPattern {
    ErrorPattern {
        category,
        regex: Regex::new(re).unwrap(),
        confidence,
        intentional: false,
    }
}

/// The ordered catalogue. Identifier-like tokens (`TypeError`, `npm ERR!`,
/// `ECONNREFUSED`) match case-sensitively; phrases match case-insensitively.
pub static CATALOGUE: LazyLock<Vec<ErrorPattern>> = LazyLock::new(|| {
    use ErrorConfidence::{High, Medium};
    vec![
        // Build failures
        pat("Build Failure", r"(?i)build failed", High),
        pat("Build Failure", r"(?i)compilation error", High),
        pat("Build Failure", r"(?i)could not compile", High),
        // Dependency issues (listed before the build family would also
        // match module-resolution text; catalogue order is authoritative)
        pat("Dependency Issue", r"(?i)cannot find module", High),
        pat("Dependency Issue", r"(?i)module not found", High),
        pat("Dependency Issue", r"npm ERR!", Medium),
        pat("Dependency Issue", r"(?i)yarn error", Medium),
        pat("Dependency Issue", r"ERESOLVE", Medium),
        pat("Dependency Issue", r"(?i)peer dependency", Medium),
        pat("Dependency Issue", r"ENOENT.*package\.json", High),
        // Test failures
        pat("Test Failure", r"(?i)test.*failed", High),
        pat("Test Failure", r"(?i)assertion.*failed", High),
        pat("Test Failure", r"(?i)expected.*but got", High),
        pat("Test Failure", r"\d+ failing", High),
        pat("Test Failure", r"AssertionError", High),
        // Syntax errors
        pat("Syntax Error", r"SyntaxError", High),
        pat("Syntax Error", r"(?i)unexpected token", High),
        pat("Syntax Error", r"(?i)invalid syntax", High),
        // Runtime errors
        pat("Runtime Error", r"TypeError", High),
        pat("Runtime Error", r"ReferenceError", High),
        pat("Runtime Error", r"RangeError", High),
        pat("Runtime Error", r"(?i)cannot read propert(y|ies)", High),
        pat("Runtime Error", r"(?i)undefined is not", High),
        // Network errors
        pat("Network Error", r"ECONNREFUSED", High),
        pat("Network Error", r"ETIMEDOUT", High),
        pat("Network Error", r"(?i)network error", Medium),
        // API errors
        pat("API Error", r"\bHTTP\s+(4\d\d|5\d\d)\b", High),
        pat("API Error", r"(?i)\bstatus code[:\s]+(4\d\d|5\d\d)\b", High),
        // CI runner errors
        pat("CI Error", r"##\[error\]", High),
        pat("CI Error", r"Error:\s+Process completed with exit code", High),
        // Process exits
        pat("Process Exit", r"(?i)exit code [1-9]\d*", High),
        pat("Process Exit", r"(?i)exited with code [1-9]\d*", High),
        pat("Process Exit", r"(?i)command failed", Medium),
        // Deliberate non-zero exit: a bare `exit N` line
        ErrorPattern {
            category: "Exit Failure",
            regex: Regex::new(r"^\s*exit\s+[1-9]\d*\s*$").unwrap(),
            confidence: High,
            intentional: true,
        },
        // Generic catch-alls
        pat("Generic", r"\bERROR\b", Medium),
        pat("Generic", r"\b(FATAL|CRITICAL)\b", High),
    ]
});

/// Tag every line of every chunk against the catalogue, set the chunks'
/// `has_errors`/`error_count`, and return the deduplicated error list.
pub fn extract_errors(chunks: &mut [Chunk]) -> Vec<DetectedError> {
    let mut all = Vec::new();

    for chunk in chunks.iter_mut() {
        let mut seen: HashMap<(&'static str, String), usize> = HashMap::new();
        let mut chunk_errors: Vec<DetectedError> = Vec::new();

        for (offset, line) in chunk.content.split('\n').enumerate() {
            let Some(pattern) = CATALOGUE.iter().find(|p| p.regex.is_match(line)) else {
                continue;
            };
            let abs_line = chunk.start_line + offset as i64;
            let message = line.trim().to_string();
            let key = (pattern.category, message.clone());

            match seen.get(&key) {
                Some(&idx) => chunk_errors[idx].evidence_lines.push(abs_line),
                None => {
                    seen.insert(key, chunk_errors.len());
                    chunk_errors.push(DetectedError {
                        category: pattern.category.to_string(),
                        message,
                        confidence: pattern.confidence,
                        evidence_lines: vec![abs_line],
                        intentional: pattern.intentional,
                        chunk_index: chunk.chunk_index,
                        step_name: chunk.step_name.clone(),
                    });
                }
            }
        }

        chunk.error_count = chunk_errors.len() as i64;
        chunk.has_errors = chunk.error_count > 0;
        all.extend(chunk_errors);
    }

    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn make_chunk(index: i64, step: &str, content: &str) -> Chunk {
        let line_count = content.split('\n').count() as i64;
        Chunk {
            id: Uuid::new_v4().to_string(),
            run_id: "run1".to_string(),
            chunk_index: index,
            step_name: step.to_string(),
            content: content.to_string(),
            start_line: 0,
            end_line: line_count - 1,
            line_count,
            token_estimate: 0,
            has_errors: false,
            error_count: 0,
            embedding: None,
        }
    }

    #[test]
    fn test_missing_module_tags_dependency_high() {
        let mut chunks = vec![make_chunk(0, "Install", "npm ERR! Cannot find module 'react'")];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, "Dependency Issue");
        assert_eq!(errors[0].confidence, ErrorConfidence::High);
    }

    #[test]
    fn test_first_catalogue_match_wins() {
        // Matches both CI Error and Process Exit; CI Error comes first.
        let mut chunks = vec![make_chunk(
            0,
            "Build",
            "Error: Process completed with exit code 1",
        )];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, "CI Error");
    }

    #[test]
    fn test_dedup_by_category_and_message() {
        let mut chunks = vec![make_chunk(
            0,
            "Test",
            "AssertionError: boom\nok line\nAssertionError: boom",
        )];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].evidence_lines, vec![0, 2]);
        assert_eq!(chunks[0].error_count, 1);
    }

    #[test]
    fn test_distinct_messages_not_deduped() {
        let mut chunks = vec![make_chunk(
            0,
            "Test",
            "AssertionError: foo\nAssertionError: bar",
        )];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors.len(), 2);
    }

    #[test]
    fn test_intentional_exit_flagged() {
        let mut chunks = vec![make_chunk(0, "Force failure", "exit 1")];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].category, "Exit Failure");
        assert!(errors[0].intentional);
    }

    #[test]
    fn test_exit_zero_not_an_error() {
        let mut chunks = vec![make_chunk(0, "S", "exit 0")];
        let errors = extract_errors(&mut chunks);
        assert!(errors.is_empty());
        assert!(!chunks[0].has_errors);
    }

    #[test]
    fn test_has_errors_iff_error_count_positive() {
        let mut chunks = vec![
            make_chunk(0, "A", "all good here"),
            make_chunk(1, "B", "ECONNREFUSED 127.0.0.1:5432"),
        ];
        extract_errors(&mut chunks);
        for c in &chunks {
            assert_eq!(c.has_errors, c.error_count > 0);
        }
        assert!(!chunks[0].has_errors);
        assert!(chunks[1].has_errors);
    }

    #[test]
    fn test_errors_carry_origin() {
        let mut chunks = vec![make_chunk(4, "Deploy", "HTTP 503 from upstream")];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors[0].chunk_index, 4);
        assert_eq!(errors[0].step_name, "Deploy");
        assert_eq!(errors[0].category, "API Error");
    }

    #[test]
    fn test_bare_error_token_is_medium_generic() {
        let mut chunks = vec![make_chunk(0, "S", "ERROR something odd")];
        let errors = extract_errors(&mut chunks);
        assert_eq!(errors[0].category, "Generic");
        assert_eq!(errors[0].confidence, ErrorConfidence::Medium);
    }

    #[test]
    fn test_absolute_evidence_lines() {
        let mut chunk = make_chunk(2, "Tail", "fine\nTypeError: x is not a function");
        chunk.start_line = 2000;
        chunk.end_line = 2001;
        let errors = extract_errors(&mut [chunk]);
        assert_eq!(errors[0].evidence_lines, vec![2001]);
    }
}
