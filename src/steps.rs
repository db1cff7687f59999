//! Step detection: group cleaned log lines into named regions.
//!
//! Detection rules, in precedence order:
//!
//! 1. A log-file marker (`--- Log File: name.txt ---`) always starts a new
//!    step and ends any prior one; the step is named after the file with
//!    its numeric prefix and `.txt` suffix stripped.
//! 2. `##[group]name` starts a step, unless the open step came from a
//!    log-file marker (markers outrank group annotations).
//! 3. `##[endgroup]` closes a group-started step; ignored for log-file steps.
//! 4. `Run <cmd>` starts a `Run: ...` step, only when no step is open.
//! 5. `Post <cmd>` starts a `Post: ...` step, only when no step is open.
//!
//! The result covers the entire line sequence with inclusive,
//! non-overlapping ranges. A log with no markers at all becomes a single
//! step named `Full Log`; an unclosed final step extends to the last line.

use regex::Regex;
use std::sync::LazyLock;

use crate::models::LogStep;

static RE_LOG_FILE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^---\s*Log File:\s*(.+\.txt)\s*---$").unwrap());
static RE_GROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\[group\](.+)$").unwrap());
static RE_ENDGROUP: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^##\[endgroup\]$").unwrap());
static RE_RUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Run\s+(.+)$").unwrap());
static RE_POST: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^Post\s+(.+)$").unwrap());
static RE_FILE_PREFIX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d+_").unwrap());

/// How the currently open step was started; gates lower-precedence rules.
#[derive(PartialEq, Clone, Copy)]
enum Origin {
    LogFile,
    Group,
    Command,
}

struct OpenStep {
    name: String,
    start: usize,
    origin: Origin,
}

/// Group cleaned lines into named steps with absolute, inclusive ranges.
pub fn detect_steps(lines: &[String]) -> Vec<LogStep> {
    if lines.is_empty() {
        return Vec::new();
    }

    let mut steps: Vec<LogStep> = Vec::new();
    let mut open: Option<OpenStep> = None;

    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = RE_LOG_FILE.captures(line) {
            if let Some(o) = open.take() {
                push_closed(&mut steps, o, i.saturating_sub(1));
            }
            open = Some(OpenStep {
                name: log_file_step_name(&caps[1]),
                start: i,
                origin: Origin::LogFile,
            });
            continue;
        }

        if let Some(caps) = RE_GROUP.captures(line) {
            if matches!(&open, Some(o) if o.origin == Origin::LogFile) {
                continue;
            }
            if let Some(o) = open.take() {
                push_closed(&mut steps, o, i.saturating_sub(1));
            }
            open = Some(OpenStep {
                name: caps[1].trim().to_string(),
                start: i,
                origin: Origin::Group,
            });
            continue;
        }

        if RE_ENDGROUP.is_match(line) {
            if matches!(&open, Some(o) if o.origin == Origin::Group) {
                let o = open.take().unwrap();
                // The endgroup line belongs to the step it closes.
                push_closed(&mut steps, o, i);
            }
            continue;
        }

        if open.is_none() {
            if let Some(caps) = RE_RUN.captures(line) {
                open = Some(OpenStep {
                    name: command_step_name("Run", &caps[1]),
                    start: i,
                    origin: Origin::Command,
                });
                continue;
            }
            if let Some(caps) = RE_POST.captures(line) {
                open = Some(OpenStep {
                    name: command_step_name("Post", &caps[1]),
                    start: i,
                    origin: Origin::Command,
                });
                continue;
            }
        }
    }

    if let Some(o) = open.take() {
        push_closed(&mut steps, o, lines.len() - 1);
    }

    if steps.is_empty() {
        return vec![LogStep {
            name: "Full Log".to_string(),
            start_line: 0,
            end_line: lines.len() - 1,
        }];
    }

    // Coverage: the first step absorbs any preamble, each step runs until
    // the next one starts, and the last step extends to the final line.
    steps[0].start_line = 0;
    for k in 0..steps.len() - 1 {
        steps[k].end_line = steps[k + 1].start_line - 1;
    }
    if let Some(last) = steps.last_mut() {
        last.end_line = lines.len() - 1;
    }

    steps
}

fn push_closed(steps: &mut Vec<LogStep>, open: OpenStep, end: usize) {
    steps.push(LogStep {
        name: open.name,
        start_line: open.start,
        end_line: end.max(open.start),
    });
}

/// `3_Build and Test.txt` → `Build and Test`.
fn log_file_step_name(file_name: &str) -> String {
    let trimmed = file_name.trim();
    let no_prefix = RE_FILE_PREFIX.replace(trimmed, "");
    let no_prefix = no_prefix.as_ref();
    no_prefix
        .strip_suffix(".txt")
        .unwrap_or(no_prefix)
        .to_string()
}

fn command_step_name(kind: &str, command: &str) -> String {
    let command = command.trim();
    if command.chars().count() > 50 {
        let prefix: String = command.chars().take(50).collect();
        format!("{}: {}...", kind, prefix)
    } else {
        format!("{}: {}", kind, command)
    }
}
