//! Provider log fetching: download the run's log archive and flatten it.
//!
//! The provider hands out a short-lived URL for a ZIP archive containing
//! one `.txt` file per job or step. Every `.txt` entry is concatenated as
//! `\n--- Log File: <entry-name> ---\n<contents>` in name order — that
//! marker is a first-class cue to the step detector.
//!
//! Errors are typed so the job runner can tell transient transport
//! failures (retry with backoff) from terminal ones (bad archive, no log
//! content): callers match on [`FetchError`] rather than string contents.

use std::io::Read;

use crate::config::ProviderConfig;

/// Decompressed bytes allowed per ZIP entry (zip-bomb protection).
const MAX_ENTRY_BYTES: u64 = 100 * 1024 * 1024;

/// Fetch failure, split by retry semantics.
#[derive(Debug)]
pub enum FetchError {
    /// Network/5xx failures; the job should retry with backoff.
    Transport(String),
    /// The archive is not a readable ZIP or an entry is oversized; terminal.
    BadArchive(String),
    /// The archive holds no `.txt` entries; terminal.
    EmptyLog,
    /// The provider is not configured for fetching; terminal.
    NotConfigured(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(e) => write!(f, "log download failed: {}", e),
            FetchError::BadArchive(e) => write!(f, "bad log archive: {}", e),
            FetchError::EmptyLog => write!(f, "empty log: archive contains no .txt entries"),
            FetchError::NotConfigured(e) => write!(f, "provider not configured: {}", e),
        }
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Transport(_))
    }
}

/// Download and flatten the log archive for one run.
pub async fn fetch_run_log(
    provider: &ProviderConfig,
    repo_full_name: &str,
    run_id: i64,
) -> Result<String, FetchError> {
    let template = provider.logs_url_template.as_deref().ok_or_else(|| {
        FetchError::NotConfigured("provider.logs_url_template is not set".to_string())
    })?;

    let url = template
        .replace("{repo}", repo_full_name)
        .replace("{run_id}", &run_id.to_string());

    let client = reqwest::Client::new();
    let mut request = client.get(&url).header("User-Agent", "ci-triage");

    if let Some(token_env) = &provider.token_env {
        match std::env::var(token_env) {
            Ok(token) => request = request.bearer_auth(token),
            Err(_) => {
                return Err(FetchError::NotConfigured(format!(
                    "token env var {} is not set",
                    token_env
                )))
            }
        }
    }

    let response = request
        .send()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let err = format!("provider returned {} for {}", status, url);
        return if status.is_server_error() || status.as_u16() == 429 {
            Err(FetchError::Transport(err))
        } else {
            Err(FetchError::BadArchive(err))
        };
    }

    let bytes = response
        .bytes()
        .await
        .map_err(|e| FetchError::Transport(e.to_string()))?;

    unzip_log_archive(&bytes)
}

/// Flatten a log archive into one text blob with `Log File` markers.
pub fn unzip_log_archive(bytes: &[u8]) -> Result<String, FetchError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| FetchError::BadArchive(e.to_string()))?;

    let mut txt_names: Vec<String> = archive
        .file_names()
        .filter(|n| n.ends_with(".txt"))
        .map(|s| s.to_string())
        .collect();
    txt_names.sort();

    if txt_names.is_empty() {
        return Err(FetchError::EmptyLog);
    }

    let mut out = String::new();
    for name in txt_names {
        let entry = archive
            .by_name(&name)
            .map_err(|e| FetchError::BadArchive(e.to_string()))?;

        let mut contents = String::new();
        entry
            .take(MAX_ENTRY_BYTES)
            .read_to_string(&mut contents)
            .map_err(|e| FetchError::BadArchive(format!("entry {}: {}", name, e)))?;
        if contents.len() as u64 >= MAX_ENTRY_BYTES {
            return Err(FetchError::BadArchive(format!(
                "entry {} exceeds size limit ({} bytes)",
                name, MAX_ENTRY_BYTES
            )));
        }

        out.push_str(&format!("\n--- Log File: {} ---\n", name));
        out.push_str(&contents);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn make_zip(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, contents) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents.as_bytes()).unwrap();
        }
        writer.finish().unwrap();
        cursor.into_inner()
    }

    #[test]
    fn test_txt_entries_concatenated_in_name_order() {
        let bytes = make_zip(&[
            ("2_Test.txt", "running tests\n"),
            ("1_Build.txt", "building\n"),
        ]);
        let log = unzip_log_archive(&bytes).unwrap();

        let build_pos = log.find("--- Log File: 1_Build.txt ---").unwrap();
        let test_pos = log.find("--- Log File: 2_Test.txt ---").unwrap();
        assert!(build_pos < test_pos);
        assert!(log.contains("building"));
        assert!(log.contains("running tests"));
    }

    #[test]
    fn test_non_txt_entries_skipped() {
        let bytes = make_zip(&[("1_Build.txt", "ok\n"), ("metadata.json", "{}")]);
        let log = unzip_log_archive(&bytes).unwrap();
        assert!(!log.contains("metadata.json"));
    }

    #[test]
    fn test_no_txt_entries_is_empty_log() {
        let bytes = make_zip(&[("metadata.json", "{}")]);
        let err = unzip_log_archive(&bytes).unwrap_err();
        assert!(matches!(err, FetchError::EmptyLog));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_garbage_is_bad_archive() {
        let err = unzip_log_archive(b"definitely not a zip").unwrap_err();
        assert!(matches!(err, FetchError::BadArchive(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_transport_errors_are_retryable() {
        assert!(FetchError::Transport("timeout".to_string()).is_retryable());
    }

    #[test]
    fn test_markers_feed_the_step_detector() {
        let bytes = make_zip(&[("1_Build and Test.txt", "cargo build\n")]);
        let log = unzip_log_archive(&bytes).unwrap();
        let lines = crate::cleaner::clean(&log);
        let steps = crate::steps::detect_steps(&lines);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "Build and Test");
    }
}
