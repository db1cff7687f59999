//! Deterministic failure classification.
//!
//! Given the chunks and the deduplicated error list, assigns a
//! [`FailureType`], a numeric priority, a confidence score with a
//! human-readable reason, and the `skip_llm` short-circuit decision.
//!
//! Detection order is strict — the first matching category wins:
//!
//! | Order | Category | Priority | Skip LLM |
//! |-------|----------|----------|----------|
//! | 1 | INTENTIONAL | configurable (0 or 5) | yes |
//! | 2 | TEST | 1 | no |
//! | 3 | BUILD | 2 | no |
//! | 4 | RUNTIME | 3 | no |
//! | 5 | INFRA | 4 | no |
//! | 6 | SECURITY | 5 | no |
//! | 7 | TIMEOUT | 6 | no |
//! | 8 | DEPENDENCY | 7 | no |
//! | 9 | CONFIG | 8 | no |
//! | 10 | PERMISSION | 9 | no |
//! | 11 | LINT | 10 | no |
//! | — | UNKNOWN | 99 | no (LLM classifies) |
//!
//! The rules are an ordered data table, like the pattern catalogue.
//! Classification cannot fail: when nothing matches, the result is UNKNOWN
//! and the analyzer hands the decision to the LLM.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::{Chunk, Classification, DetectedError, FailureType, Narrative};

static RE_EXPLICIT_EXIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*exit\s+[1-9]\d*\s*$").unwrap());

/// One entry in the ordered detection table. A rule matches when any
/// detected error carries one of its categories, or when any chunk line
/// matches its content heuristic.
struct DetectionRule {
    failure_type: FailureType,
    error_categories: &'static [&'static str],
    content: Option<Regex>,
    /// Signal noun for the confidence reason, e.g. `"test failure"`.
    label: &'static str,
}

fn rule(
    failure_type: FailureType,
    error_categories: &'static [&'static str],
    content: Option<&str>,
    label: &'static str,
) -> DetectionRule {
    DetectionRule {
        failure_type,
        error_categories,
        content: content.map(|re| Regex::new(re).unwrap()),
        label,
    }
}

static RULES: LazyLock<Vec<DetectionRule>> = LazyLock::new(|| {
    vec![
        rule(
            FailureType::Test,
            &["Test Failure"],
            Some(r"(?i)(\bjest\b|\bmocha\b|\bvitest\b|\bpytest\b|FAIL(ED)?\s+tests?)"),
            "test failure",
        ),
        rule(
            FailureType::Build,
            &["Build Failure", "Syntax Error"],
            Some(r"(?i)(\bTS\d{4}\b|webpack.*error|\btsc\b.*error|bundler error)"),
            "build failure",
        ),
        rule(
            FailureType::Runtime,
            &["Runtime Error"],
            Some(r"(UnhandledPromiseRejection|panicked at|Traceback \(most recent call last\))"),
            "runtime error",
        ),
        rule(
            FailureType::Infra,
            &["Network Error"],
            Some(r"(?i)(connection (refused|reset)|ECONNRESET|docker daemon|kubernetes|kubectl|database .*(unavailable|connection)|redis.*(down|refused))"),
            "infrastructure error",
        ),
        rule(
            FailureType::Security,
            &[],
            Some(r"(?i)(CVE-\d{4}-\d+|vulnerabilit|security audit|authentication fail|unauthorized|forbidden token)"),
            "security finding",
        ),
        rule(
            FailureType::Timeout,
            &[],
            Some(r"(?i)(\btime(d)? ?out\b|deadline exceeded)"),
            "timeout",
        ),
        rule(
            FailureType::Dependency,
            &["Dependency Issue"],
            Some(r"(?i)(could not resolve dependency|version solving failed)"),
            "dependency issue",
        ),
        rule(
            FailureType::Config,
            &[],
            Some(r"(?i)(missing (required )?env(ironment)? var|env var .* (is )?not set|invalid (yaml|json)|configuration error)"),
            "configuration error",
        ),
        rule(
            FailureType::Permission,
            &[],
            Some(r"(EACCES|EPERM|(?i:permission denied))"),
            "permission error",
        ),
        rule(
            FailureType::Lint,
            &[],
            Some(r"(?i)(eslint|prettier|clippy|rustfmt|lint (error|warning)|\bwarning\b.*\blint\b)"),
            "lint finding",
        ),
    ]
});

/// Classify a run from its chunks and deduplicated errors.
///
/// `intentional_priority` resolves the configurable rank of deliberate
/// failures (0 or 5). Never fails; returns UNKNOWN when nothing matches.
pub fn classify(
    chunks: &[Chunk],
    errors: &[DetectedError],
    intentional_priority: i64,
) -> Classification {
    if let Some(c) = detect_intentional(chunks, errors, intentional_priority) {
        return c;
    }

    for rule in RULES.iter() {
        let category_hits = errors
            .iter()
            .filter(|e| rule.error_categories.contains(&e.category.as_str()))
            .count();
        let content_hits = match &rule.content {
            Some(re) => chunks
                .iter()
                .flat_map(|c| c.content.split('\n'))
                .filter(|line| re.is_match(line))
                .count(),
            None => 0,
        };
        let total = category_hits + content_hits;
        if total == 0 {
            continue;
        }

        let confidence = (0.6 + 0.05 * total as f64).min(0.95);
        return Classification {
            failure_type: rule.failure_type,
            priority: rule.failure_type.priority(intentional_priority),
            confidence,
            reason: format!(
                "{} {}{} detected",
                total,
                rule.label,
                if total == 1 { "" } else { "(s)" }
            ),
            skip_llm: false,
            narrative: None,
        };
    }

    Classification {
        failure_type: FailureType::Unknown,
        priority: FailureType::Unknown.priority(intentional_priority),
        confidence: 0.0,
        reason: "no deterministic pattern matched".to_string(),
        skip_llm: false,
        narrative: None,
    }
}

/// INTENTIONAL is a firm short-circuit: an explicit `exit N` line, or a
/// step named like a forced-failure fixture that actually produced errors.
fn detect_intentional(
    chunks: &[Chunk],
    errors: &[DetectedError],
    intentional_priority: i64,
) -> Option<Classification> {
    let explicit_exit = chunks.iter().find_map(|c| {
        c.content
            .split('\n')
            .find(|line| RE_EXPLICIT_EXIT.is_match(line))
            .map(|line| (c.step_name.clone(), line.trim().to_string()))
    });

    let forced_step = chunks.iter().find(|c| {
        let name = c.step_name.to_lowercase();
        name.contains("force") && name.contains("fail") && !errors.is_empty()
    });

    let (step_name, exit_line) = match (explicit_exit, forced_step) {
        (Some((step, line)), _) => (step, line),
        (None, Some(c)) => (c.step_name.clone(), "exit 1".to_string()),
        (None, None) => return None,
    };

    let narrative = Narrative {
        root_cause: format!(
            "The workflow terminated because the step \"{}\" runs an explicit `{}`. \
             This is a deliberate failure, not a defect in the build or tests.",
            step_name, exit_line
        ),
        failure_stage: step_name,
        suggested_fix: format!(
            "If this forced failure has served its purpose, remove the `{}` line \
             (or the step that runs it). If it is a permanent CI fixture, mark the \
             job as allowed to fail so it stops paging anyone.",
            exit_line
        ),
    };

    Some(Classification {
        failure_type: FailureType::Intentional,
        priority: FailureType::Intentional.priority(intentional_priority),
        confidence: 1.0,
        reason: "explicit non-zero exit detected".to_string(),
        skip_llm: true,
        narrative: Some(narrative),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patterns::extract_errors;
    use uuid::Uuid;

    fn chunk_from(step: &str, content: &str) -> Chunk {
        let line_count = content.split('\n').count() as i64;
        Chunk {
            id: Uuid::new_v4().to_string(),
            run_id: "run1".to_string(),
            chunk_index: 0,
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

    fn classify_log(step: &str, content: &str, intentional_priority: i64) -> Classification {
        let mut chunks = vec![chunk_from(step, content)];
        let errors = extract_errors(&mut chunks);
        classify(&chunks, &errors, intentional_priority)
    }

    #[test]
    fn test_explicit_exit_is_intentional_and_skips_llm() {
        let c = classify_log("Force CI failure (testing)", "exit 1", 0);
        assert_eq!(c.failure_type, FailureType::Intentional);
        assert!(c.skip_llm);
        assert_eq!(c.priority, 0);
        let n = c.narrative.expect("intentional carries a narrative");
        assert_eq!(n.failure_stage, "Force CI failure (testing)");
        assert!(n.suggested_fix.contains("exit 1"));
    }

    #[test]
    fn test_intentional_priority_is_configurable() {
        for p in [0i64, 5] {
            let c = classify_log("Force failure", "exit 1", p);
            assert_eq!(c.priority, p);
            assert!(c.skip_llm);
        }
    }

    #[test]
    fn test_forced_step_name_with_errors_is_intentional() {
        let c = classify_log("force-fail smoke job", "##[error]Process exited", 0);
        assert_eq!(c.failure_type, FailureType::Intentional);
    }

    #[test]
    fn test_forced_step_name_without_errors_is_not_intentional() {
        let c = classify_log("force-fail smoke job", "all green", 0);
        assert_ne!(c.failure_type, FailureType::Intentional);
    }

    #[test]
    fn test_test_beats_lint_in_detection_order() {
        let c = classify_log(
            "CI",
            "AssertionError: expected 2 to equal 3\neslint warning: no-unused-vars",
            0,
        );
        assert_eq!(c.failure_type, FailureType::Test);
        assert_eq!(c.priority, 1);
        assert!(!c.skip_llm);
    }

    #[test]
    fn test_dependency_from_catalogue_tag() {
        let c = classify_log("Install", "npm ERR! Cannot find module 'react'", 0);
        assert_eq!(c.failure_type, FailureType::Dependency);
        assert_eq!(c.priority, 7);
    }

    #[test]
    fn test_build_failure() {
        let c = classify_log("Compile", "error TS2304: Cannot find name 'foo'\nbuild failed", 0);
        assert_eq!(c.failure_type, FailureType::Build);
        assert_eq!(c.priority, 2);
    }

    #[test]
    fn test_runtime_error() {
        let c = classify_log("Serve", "TypeError: Cannot read properties of undefined", 0);
        assert_eq!(c.failure_type, FailureType::Runtime);
        assert_eq!(c.priority, 3);
    }

    #[test]
    fn test_infra_error() {
        let c = classify_log("Migrate", "connect ECONNREFUSED 10.0.0.2:5432", 0);
        assert_eq!(c.failure_type, FailureType::Infra);
        assert_eq!(c.priority, 4);
    }

    #[test]
    fn test_timeout() {
        let c = classify_log("E2E", "context deadline exceeded while waiting for page", 0);
        assert_eq!(c.failure_type, FailureType::Timeout);
        assert_eq!(c.priority, 6);
    }

    #[test]
    fn test_permission() {
        let c = classify_log("Publish", "EACCES: permission denied, open '/usr/lib/node'", 0);
        assert_eq!(c.failure_type, FailureType::Permission);
        assert_eq!(c.priority, 9);
    }

    #[test]
    fn test_unknown_default() {
        let c = classify_log("Weird", "0x0000DEAD fault in sector 7", 0);
        assert_eq!(c.failure_type, FailureType::Unknown);
        assert_eq!(c.priority, 99);
        assert!(!c.skip_llm);
    }

    #[test]
    fn test_confidence_has_reason_and_bounds() {
        let c = classify_log("Test", "3 failing\nAssertionError: nope", 0);
        assert!(c.confidence > 0.0 && c.confidence <= 1.0);
        assert!(c.reason.contains("test failure"));
    }

    #[test]
    fn test_determinism() {
        let a = classify_log("Test", "AssertionError: x\n2 failing", 0);
        let b = classify_log("Test", "AssertionError: x\n2 failing", 0);
        assert_eq!(a.failure_type, b.failure_type);
        assert_eq!(a.priority, b.priority);
        assert_eq!(a.reason, b.reason);
        assert!((a.confidence - b.confidence).abs() < f64::EPSILON);
    }
}
