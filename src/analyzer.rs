//! Analysis orchestration: classify → retrieve → generate → parse → write.
//!
//! The analyzer coordinates the deterministic classifier, the RAG
//! retrieval step, and the LLM call, and guarantees that every processed
//! run ends with exactly one [`AnalysisResult`]:
//!
//! 1. Run the classifier.
//! 2. If it short-circuits (INTENTIONAL), emit its narrative with
//!    `used_llm = false`.
//! 3. Otherwise build the base prompt, splice in retrieved similar cases,
//!    call the LLM, and parse the response — first as a balanced JSON
//!    object, then with a line-label heuristic, and finally falling back
//!    to a fixed narrative when generation itself failed.
//! 4. When the classifier returned UNKNOWN, a second strict-schema LLM
//!    call may assign a category; the returned name is normalized
//!    (uppercased, non-alphanumerics to underscores, empty to UNKNOWN).
//!
//! LLM errors never propagate out of this module.

use anyhow::Result;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::classifier;
use crate::config::Config;
use crate::llm;
use crate::models::{
    AnalysisResult, Chunk, Classification, DetectedError, FailureType, LogStep, Narrative,
};
use crate::prompt;
use crate::rag;
use crate::store;

const ROOT_CAUSE_MAX_CHARS: usize = 300;
const STAGE_MAX_CHARS: usize = 100;
const FIX_MAX_CHARS: usize = 500;

/// Analyze a run's parsed log and upsert its [`AnalysisResult`].
pub async fn analyze_run(
    pool: &SqlitePool,
    config: &Config,
    run_id: &str,
    chunks: &[Chunk],
    errors: &[DetectedError],
    steps: &[LogStep],
    created_at: i64,
) -> Result<AnalysisResult> {
    let verdict = analyze(pool, config, chunks, errors).await;

    let result = AnalysisResult {
        id: Uuid::new_v4().to_string(),
        run_id: run_id.to_string(),
        root_cause: verdict.narrative.root_cause,
        failure_stage: verdict.narrative.failure_stage,
        suggested_fix: verdict.narrative.suggested_fix,
        failure_type: verdict.failure_type,
        priority: verdict.priority,
        confidence: verdict.confidence,
        used_llm: verdict.used_llm,
        detected_errors: errors.to_vec(),
        steps: steps.to_vec(),
        created_at,
    };

    store::upsert_analysis(pool, &result).await?;
    Ok(result)
}

/// A complete verdict before persistence; also the payload of the
/// synchronous `/analyze` endpoint, which skips the upsert.
pub struct Verdict {
    pub narrative: Narrative,
    pub failure_type: String,
    pub priority: i64,
    pub confidence: f64,
    pub used_llm: bool,
    pub classification: Classification,
}

/// Produce a verdict without touching the analysis table.
pub async fn analyze(
    pool: &SqlitePool,
    config: &Config,
    chunks: &[Chunk],
    errors: &[DetectedError],
) -> Verdict {
    let classification =
        classifier::classify(chunks, errors, config.classifier.intentional_priority);

    if classification.skip_llm {
        let narrative = classification
            .narrative
            .clone()
            .unwrap_or_else(|| fallback_narrative(&classification, errors));
        return Verdict {
            narrative,
            failure_type: classification.failure_type.as_str().to_string(),
            priority: classification.priority,
            confidence: classification.confidence,
            used_llm: false,
            classification,
        };
    }

    // Resolve UNKNOWN through the model before narrative analysis so the
    // stored tag reflects the better of the two opinions.
    let (failure_type, priority) = if classification.failure_type == FailureType::Unknown {
        classify_with_llm(config, errors, chunks).await
    } else {
        (
            classification.failure_type.as_str().to_string(),
            classification.priority,
        )
    };

    let query = rag::build_query(errors, chunks);
    let current_run = chunks.first().map(|c| c.run_id.as_str());
    let cases =
        match rag::retrieve(pool, &config.embedding, &config.rag, &query, current_run).await {
            Ok(cases) => cases,
            Err(e) => {
                eprintln!("Warning: similar-case retrieval failed: {}", e);
                Vec::new()
            }
        };

    let context = rag::format_context(&cases);
    let prompt_text = prompt::build_analysis_prompt(&classification, errors, chunks, &context);

    match llm::generate(&config.llm, &prompt_text).await {
        Ok(response) => {
            let narrative = parse_narrative(&response)
                .unwrap_or_else(|| fallback_narrative(&classification, errors));
            Verdict {
                narrative,
                failure_type,
                priority,
                confidence: rag::synthesize_confidence(&cases),
                used_llm: true,
                classification,
            }
        }
        Err(e) => {
            eprintln!("Warning: LLM generation failed, using fallback narrative: {}", e);
            Verdict {
                narrative: fallback_narrative(&classification, errors),
                failure_type,
                priority,
                confidence: 0.5,
                used_llm: false,
                classification,
            }
        }
    }
}

/// Ask the model for a category when the deterministic classifier came up
/// empty. Any failure leaves the tag as UNKNOWN.
async fn classify_with_llm(
    config: &Config,
    errors: &[DetectedError],
    chunks: &[Chunk],
) -> (String, i64) {
    let prompt_text = prompt::build_classification_prompt(errors, chunks);

    let category = match llm::generate(&config.llm, &prompt_text).await {
        Ok(response) => extract_first_json_object(&response)
            .and_then(|json| serde_json::from_str::<serde_json::Value>(json).ok())
            .and_then(|v| v.get("category").and_then(|c| c.as_str()).map(String::from))
            .map(|raw| normalize_category(&raw))
            .unwrap_or_else(|| "UNKNOWN".to_string()),
        Err(e) => {
            eprintln!("Warning: LLM classification failed: {}", e);
            "UNKNOWN".to_string()
        }
    };

    let priority = known_priority(&category, config.classifier.intentional_priority);
    (category, priority)
}

fn known_priority(category: &str, intentional_priority: i64) -> i64 {
    let known = [
        FailureType::Intentional,
        FailureType::Test,
        FailureType::Build,
        FailureType::Runtime,
        FailureType::Infra,
        FailureType::Security,
        FailureType::Timeout,
        FailureType::Dependency,
        FailureType::Config,
        FailureType::Permission,
        FailureType::Lint,
    ];
    known
        .iter()
        .find(|t| t.as_str() == category)
        .map(|t| t.priority(intentional_priority))
        .unwrap_or(99)
}

/// Uppercase, non-alphanumerics to underscores, empty to UNKNOWN.
pub fn normalize_category(raw: &str) -> String {
    let normalized: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();

    if normalized.chars().all(|c| c == '_') {
        "UNKNOWN".to_string()
    } else {
        normalized
    }
}

/// The fixed narrative used whenever generation fails or returns nothing
/// parseable. Leans on the deterministic signals so the result is still
/// actionable.
pub fn fallback_narrative(
    classification: &Classification,
    errors: &[DetectedError],
) -> Narrative {
    let top_error = errors
        .first()
        .map(|e| format!(" Strongest signal: [{}] {}.", e.category, e.message))
        .unwrap_or_default();

    Narrative {
        root_cause: format!(
            "Automated analysis was unavailable for this run. Deterministic \
             classification: {} ({}).{}",
            classification.failure_type.as_str(),
            classification.reason,
            top_error
        ),
        failure_stage: errors
            .first()
            .map(|e| e.step_name.clone())
            .unwrap_or_else(|| "unknown".to_string()),
        suggested_fix: "Review the detected errors and the final lines of the failing \
                        step, then address the highest-priority error first."
            .to_string(),
    }
}

/// Parse the model response: balanced JSON object first, line-label
/// heuristic second.
pub fn parse_narrative(response: &str) -> Option<Narrative> {
    if let Some(json) = extract_first_json_object(response) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(json) {
            let get = |key: &str| {
                value
                    .get(key)
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
            };
            if let (Some(root_cause), Some(failure_stage), Some(suggested_fix)) =
                (get("rootCause"), get("failureStage"), get("suggestedFix"))
            {
                return Some(Narrative {
                    root_cause,
                    failure_stage,
                    suggested_fix,
                });
            }
        }
    }

    heuristic_narrative(response)
}

/// Extract the first balanced `{...}` group, respecting string literals
/// and escapes. A permissive scanner, not a regex.
pub fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + i + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Clone, Copy, PartialEq)]
enum Field {
    Root,
    Stage,
    Fix,
}

/// Heuristic field labels, checked in order; the more specific multi-word
/// forms come first so `suggested fix` is not consumed by `fix` mid-line.
const LABELS: [(&str, Field); 7] = [
    ("root cause", Field::Root),
    ("failure stage", Field::Stage),
    ("suggested fix", Field::Fix),
    ("stage", Field::Stage),
    ("step", Field::Stage),
    ("solution", Field::Fix),
    ("fix", Field::Fix),
];

/// Label-scanning fallback: capture the lines following `root cause`,
/// `stage`/`step`, and `fix`/`solution` headings.
fn heuristic_narrative(text: &str) -> Option<Narrative> {
    let mut root = String::new();
    let mut stage = String::new();
    let mut fix = String::new();
    let mut current: Option<Field> = None;

    for line in text.lines() {
        let lower = line.to_lowercase();
        let labeled = LABELS
            .iter()
            .find_map(|(needle, field)| {
                lower
                    .find(needle)
                    .map(|pos| (*field, after_label(line, pos + needle.len())))
            });

        match labeled {
            Some((field, remainder)) => {
                current = Some(field);
                append_field(field, &remainder, &mut root, &mut stage, &mut fix);
            }
            None => {
                if let Some(field) = current {
                    append_field(field, line.trim(), &mut root, &mut stage, &mut fix);
                }
            }
        }
    }

    if root.is_empty() && stage.is_empty() && fix.is_empty() {
        return None;
    }

    Some(Narrative {
        root_cause: truncate_chars(or_default(&root, "Not determined"), ROOT_CAUSE_MAX_CHARS),
        failure_stage: truncate_chars(or_default(&stage, "unknown"), STAGE_MAX_CHARS),
        suggested_fix: truncate_chars(
            or_default(&fix, "Inspect the failing step's log tail."),
            FIX_MAX_CHARS,
        ),
    })
}

fn after_label(line: &str, label_end: usize) -> String {
    // Byte offsets come from a lowercased copy; non-ASCII text can shift
    // them off a char boundary, in which case the remainder is dropped.
    let rest = line.get(label_end..).unwrap_or("");
    rest.trim_start_matches([':', '*', '-', ' ']).trim().to_string()
}

fn append_field(field: Field, text: &str, root: &mut String, stage: &mut String, fix: &mut String) {
    if text.is_empty() {
        return;
    }
    let target = match field {
        Field::Root => root,
        Field::Stage => stage,
        Field::Fix => fix,
    };
    if !target.is_empty() {
        target.push(' ');
    }
    target.push_str(text);
}

fn or_default<'a>(s: &'a str, default: &'a str) -> &'a str {
    if s.is_empty() {
        default
    } else {
        s
    }
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        s.chars().take(max).collect()
    } else {
        s.to_string()
    }
}
