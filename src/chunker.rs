//! Step partitioning into size-bounded chunks.
//!
//! Each step becomes one chunk when it fits in `max_lines`, or
//! `⌈N / max_lines⌉` contiguous chunks named `<step> (part k)` otherwise.
//! Chunk indices are assigned from a single global counter starting at 0,
//! so the indices of a run always form a dense prefix `0..N-1`.

use uuid::Uuid;

use crate::models::{Chunk, LogStep};

/// Partition the cleaned lines of a run into chunks along step boundaries.
///
/// `lines` is the full cleaned sequence; `steps` must cover it (the step
/// detector guarantees this). Error fields are left zeroed here and filled
/// by the extractor; embeddings start out unset.
pub fn chunk_steps(
    run_id: &str,
    lines: &[String],
    steps: &[LogStep],
    max_lines: usize,
    tokens_per_char: f64,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut index: i64 = 0;

    for step in steps {
        let step_lines = &lines[step.start_line..=step.end_line];
        let parts = step_lines.len().div_ceil(max_lines).max(1);

        for (k, part) in step_lines.chunks(max_lines).enumerate() {
            let name = if parts == 1 {
                step.name.clone()
            } else {
                format!("{} (part {})", step.name, k + 1)
            };

            let start_line = (step.start_line + k * max_lines) as i64;
            let end_line = start_line + part.len() as i64 - 1;
            let content = part.join("\n");
            let token_estimate = estimate_tokens(&content, tokens_per_char);

            chunks.push(Chunk {
                id: Uuid::new_v4().to_string(),
                run_id: run_id.to_string(),
                chunk_index: index,
                step_name: name,
                content,
                start_line,
                end_line,
                line_count: part.len() as i64,
                token_estimate,
                has_errors: false,
                error_count: 0,
                embedding: None,
            });
            index += 1;
        }
    }

    chunks
}

/// `⌈chars × tokens_per_char⌉` — the 4-chars-per-token approximation.
pub fn estimate_tokens(content: &str, tokens_per_char: f64) -> i64 {
    (content.chars().count() as f64 * tokens_per_char).ceil() as i64
}
