//! Log text normalization.
//!
//! Turns raw CI log output into a clean, ordered line sequence the rest of
//! the pipeline can reason about: ANSI control sequences and leading ISO
//! timestamps are stripped, stray carriage returns become newlines, lines
//! are trimmed, and empty lines are dropped. Output order equals input
//! order minus drops, and cleaning is idempotent.

use regex::Regex;
use std::sync::LazyLock;

/// CSI family: `ESC [ ... final-byte`.
static RE_ANSI_CSI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]").unwrap());

/// OSC family: `ESC ] ... (BEL | ESC \)`.
static RE_ANSI_OSC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)").unwrap());

/// Leading ISO-8601 timestamp, e.g. `2024-03-01T12:34:56.7891011Z `.
static RE_TIMESTAMP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(?:\.\d+)?Z\s+").unwrap());

/// Normalize raw log text into an ordered sequence of non-empty lines.
pub fn clean(raw: &str) -> Vec<String> {
    let no_ansi = RE_ANSI_OSC.replace_all(raw, "");
    let no_ansi = RE_ANSI_CSI.replace_all(&no_ansi, "");

    // CRLF first so lone \r handling doesn't double newlines.
    let normalized = no_ansi.replace("\r\n", "\n").replace('\r', "\n");

    normalized
        .split('\n')
        .filter_map(|line| {
            let mut s = line.trim();
            // Providers occasionally prefix a line more than once (nested
            // runners); strip until stable so cleaning stays idempotent.
            while let Some(m) = RE_TIMESTAMP.find(s) {
                s = s[m.end()..].trim_start();
            }
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_ansi_csi() {
        let lines = clean("\x1b[31merror:\x1b[0m something broke");
        assert_eq!(lines, vec!["error: something broke"]);
    }

    #[test]
    fn test_strips_ansi_osc() {
        let lines = clean("\x1b]0;window title\x07npm test");
        assert_eq!(lines, vec!["npm test"]);
    }

    #[test]
    fn test_strips_leading_timestamp() {
        let lines = clean("2024-03-01T12:34:56.7891011Z npm ERR! code 1");
        assert_eq!(lines, vec!["npm ERR! code 1"]);
    }

    #[test]
    fn test_timestamp_without_fraction() {
        let lines = clean("2024-03-01T12:34:56Z Run cargo test");
        assert_eq!(lines, vec!["Run cargo test"]);
    }

    #[test]
    fn test_timestamp_in_middle_is_kept() {
        let lines = clean("finished at 2024-03-01T12:34:56Z ok");
        assert_eq!(lines, vec!["finished at 2024-03-01T12:34:56Z ok"]);
    }

    #[test]
    fn test_stray_carriage_return_becomes_newline() {
        let lines = clean("progress 10%\rprogress 100%\ndone");
        assert_eq!(lines, vec!["progress 10%", "progress 100%", "done"]);
    }

    #[test]
    fn test_drops_empty_lines_preserves_order() {
        let lines = clean("first\n\n   \nsecond\n\nthird\n");
        assert_eq!(lines, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_idempotent() {
        let raw = "2024-03-01T12:00:00Z \x1b[1mRun build\x1b[0m\r\nstep one\r\n\nexit 1\n";
        let once = clean(raw);
        let twice = clean(&once.join("\n"));
        assert_eq!(once, twice);
    }

    #[test]
    fn test_doubled_timestamp_prefix() {
        let once = clean("2024-03-01T12:00:00Z 2024-03-01T12:00:00Z hello");
        assert_eq!(once, vec!["hello"]);
    }

    #[test]
    fn test_empty_input() {
        assert!(clean("").is_empty());
        assert!(clean("\n\n\n").is_empty());
    }
}
