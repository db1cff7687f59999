//! Core data models used throughout the triage pipeline.
//!
//! These types represent the runs, chunks, detected errors, and analysis
//! results that flow through ingestion and analysis. The data lifecycle is:
//!
//! ```text
//! raw log → clean() → detect_steps() → chunk_steps() → Chunk
//!                                           ↓
//!                                  extract_errors() → DetectedError
//!                                           ↓
//!                                    classify() → Classification
//!                                           ↓
//!                                    analyze() → AnalysisResult
//! ```
//!
//! # Type Relationships
//!
//! - A **[`Run`]** is one terminal CI workflow run, upserted by
//!   provider run id when a webhook arrives.
//! - A **[`Chunk`]** is a contiguous slice of cleaned log lines belonging
//!   to exactly one step; a run exclusively owns its chunks.
//! - A **[`DetectedError`]** is a pattern-catalogue hit, embedded as JSON
//!   inside the run's [`AnalysisResult`] rather than stored independently.
//! - An **[`AnalysisResult`]** is the single per-run verdict; exactly one
//!   exists per run after the pipeline completes.

use serde::{Deserialize, Serialize};

/// A repository imported from the CI provider.
///
/// `provider_id` is globally unique; deleting a repository cascades to its
/// runs (and through them to chunks and analysis results).
#[derive(Debug, Clone)]
pub struct Repository {
    /// UUID v4 primary key.
    pub id: String,
    /// Provider-side repository id (unique globally).
    pub provider_id: i64,
    pub owner: String,
    pub name: String,
    pub private: bool,
    /// Owning user, when the import was user-initiated.
    pub user_id: Option<String>,
}

impl Repository {
    /// `owner/name` as the provider renders it.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Terminal status of a CI run. Status is terminal once set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Failure,
    Cancelled,
    TimedOut,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failure => "failure",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
            RunStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(RunStatus::Success),
            "failure" => Some(RunStatus::Failure),
            "cancelled" => Some(RunStatus::Cancelled),
            "timed_out" => Some(RunStatus::TimedOut),
            "skipped" => Some(RunStatus::Skipped),
            _ => None,
        }
    }
}

/// A terminal-state CI workflow run, upserted by `provider_run_id`.
#[derive(Debug, Clone)]
pub struct Run {
    /// UUID v4 primary key.
    pub id: String,
    /// Provider-side run id (unique globally).
    pub provider_run_id: i64,
    /// Foreign key to the owning [`Repository`].
    pub repo_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    /// What triggered the run (`push`, `pull_request`, ...).
    pub trigger: Option<String>,
    pub commit_sha: Option<String>,
    pub branch: Option<String>,
    pub actor: Option<String>,
    /// Web-browsable URL on the provider.
    pub provider_url: Option<String>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// A named region of a log with an inclusive, absolute line range.
///
/// Produced by the step detector; ranges cover the cleaned line sequence
/// with no gaps and no overlaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogStep {
    pub name: String,
    /// First line of the step (0-based, inclusive).
    pub start_line: usize,
    /// Last line of the step (0-based, inclusive).
    pub end_line: usize,
}

/// A contiguous slice of cleaned log lines belonging to exactly one step.
///
/// # Fields
///
/// | Field | Description |
/// |-------|-------------|
/// | `chunk_index` | 0-based, dense per run: indices always form `0..N-1` |
/// | `step_name` | Owning step; oversized steps carry a ` (part k)` suffix |
/// | `content` | Lines joined with single newlines |
/// | `start_line` / `end_line` | Absolute positions in the cleaned sequence (inclusive) |
/// | `token_estimate` | `ceil(chars × tokens_per_char)` |
/// | `has_errors` | Invariant: `has_errors ⇔ error_count > 0` |
/// | `embedding` | Nullable vector, filled best-effort after persistence |
#[derive(Debug, Clone)]
pub struct Chunk {
    /// UUID v4 primary key.
    pub id: String,
    /// Foreign key to the owning [`Run`].
    pub run_id: String,
    pub chunk_index: i64,
    pub step_name: String,
    pub content: String,
    pub start_line: i64,
    pub end_line: i64,
    pub line_count: i64,
    pub token_estimate: i64,
    pub has_errors: bool,
    pub error_count: i64,
    /// Embedding vector (expected 768-dim); `None` until the embedder runs.
    pub embedding: Option<Vec<f32>>,
}

/// Pattern-match confidence for a detected error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorConfidence {
    High,
    Medium,
    Low,
}

/// A single pattern-catalogue hit, deduplicated per chunk by
/// `(category, message)`.
///
/// Stored as JSON inside [`AnalysisResult`]; not an independent entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectedError {
    pub category: String,
    /// The matching line, trimmed.
    pub message: String,
    pub confidence: ErrorConfidence,
    /// Absolute line numbers that evidence this error.
    pub evidence_lines: Vec<i64>,
    /// True for deliberate non-zero exits (`exit 1` fixtures).
    pub intentional: bool,
    /// Originating chunk index.
    pub chunk_index: i64,
    /// Originating step name.
    pub step_name: String,
}

/// Failure category assigned by the deterministic classifier.
///
/// Detection order is strict and lives in [`crate::classifier`]; the
/// numeric priority here ranks severity (lower is more severe), with
/// INTENTIONAL configurable per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    Intentional,
    Test,
    Build,
    Runtime,
    Infra,
    Security,
    Timeout,
    Dependency,
    Config,
    Permission,
    Lint,
    Unknown,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureType::Intentional => "INTENTIONAL",
            FailureType::Test => "TEST",
            FailureType::Build => "BUILD",
            FailureType::Runtime => "RUNTIME",
            FailureType::Infra => "INFRA",
            FailureType::Security => "SECURITY",
            FailureType::Timeout => "TIMEOUT",
            FailureType::Dependency => "DEPENDENCY",
            FailureType::Config => "CONFIG",
            FailureType::Permission => "PERMISSION",
            FailureType::Lint => "LINT",
            FailureType::Unknown => "UNKNOWN",
        }
    }

    /// Numeric priority. `intentional_priority` resolves the configurable
    /// rank of deliberate failures (0 or 5).
    pub fn priority(&self, intentional_priority: i64) -> i64 {
        match self {
            FailureType::Intentional => intentional_priority,
            FailureType::Test => 1,
            FailureType::Build => 2,
            FailureType::Runtime => 3,
            FailureType::Infra => 4,
            FailureType::Security => 5,
            FailureType::Timeout => 6,
            FailureType::Dependency => 7,
            FailureType::Config => 8,
            FailureType::Permission => 9,
            FailureType::Lint => 10,
            FailureType::Unknown => 99,
        }
    }
}

/// The narrative triple every analysis produces, whatever its provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Narrative {
    pub root_cause: String,
    pub failure_stage: String,
    pub suggested_fix: String,
}

/// Output of the deterministic classifier.
///
/// `skip_llm` short-circuits the analyzer: when set, `narrative` is
/// populated and the LLM is never consulted.
#[derive(Debug, Clone)]
pub struct Classification {
    pub failure_type: FailureType,
    pub priority: i64,
    /// Score in `[0, 1]`.
    pub confidence: f64,
    /// Human-readable reason, e.g. `"12 test failure(s) detected"`.
    pub reason: String,
    pub skip_llm: bool,
    pub narrative: Option<Narrative>,
}

/// The single per-run analysis verdict, upserted keyed by `run_id`.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// UUID v4 primary key.
    pub id: String,
    /// Foreign key to the owning [`Run`]; unique.
    pub run_id: String,
    pub root_cause: String,
    pub failure_stage: String,
    pub suggested_fix: String,
    /// [`FailureType`] tag as stored.
    pub failure_type: String,
    /// Priority in `0..=99` (99 = unknown).
    pub priority: i64,
    pub confidence: f64,
    /// Provenance: true when the narrative came from the LLM.
    pub used_llm: bool,
    pub detected_errors: Vec<DetectedError>,
    pub steps: Vec<LogStep>,
    /// Creation timestamp (Unix epoch seconds).
    pub created_at: i64,
}

/// A historical case returned by the analysis-joined vector search.
///
/// Rows without an analysis are still returned with the analysis fields
/// unset, so callers can distinguish "similar but never analyzed".
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarCase {
    pub chunk_id: String,
    pub run_id: String,
    pub step_name: String,
    /// Chunk content, truncated for prompt use.
    pub excerpt: String,
    /// `1 − cosine_distance`; higher is more similar.
    pub similarity: f64,
    pub workflow_name: String,
    pub branch: Option<String>,
    pub root_cause: Option<String>,
    pub suggested_fix: Option<String>,
}

/// Embedding coverage summary.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingStats {
    pub total: i64,
    pub with_embeddings: i64,
    pub without_embeddings: i64,
    pub percent_complete: f64,
}
