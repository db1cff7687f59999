//! Text-generation client for the analysis step.
//!
//! Dispatches on the configured provider:
//! - **`openai`** — OpenAI-compatible `POST /v1/chat/completions`.
//! - **`ollama`** — a local Ollama instance's `/api/generate` endpoint.
//! - **`mock`** — a fixed, well-formed JSON narrative; used by tests,
//!   offline development, and as the shape the fallback path mirrors.
//!
//! Retry strategy matches the embedder: 429/5xx/network errors retry with
//! exponential backoff, other 4xx fail immediately. Callers treat any
//! remaining error as "fall back to the canned narrative" — generation
//! failures never fail a job.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChoiceMessage {
    content: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

/// The canned response used by the `mock` provider. Carries every field
/// any caller parses, so both narrative analysis and fallback
/// classification behave deterministically without a network.
pub const MOCK_RESPONSE: &str = r#"{
  "rootCause": "Automated analysis: the run failed; the strongest detected error signals point at the failing step recorded alongside this result.",
  "failureStage": "See detected errors",
  "suggestedFix": "Inspect the detected errors and the final log lines of the failing step, then re-run the workflow after addressing the first error in priority order.",
  "category": "UNKNOWN"
}"#;

/// Generate a completion for `prompt` using the configured provider.
pub async fn generate(config: &LlmConfig, prompt: &str) -> Result<String> {
    match config.provider.as_str() {
        "openai" => generate_openai(config, prompt).await,
        "ollama" => generate_ollama(config, prompt).await,
        "mock" => Ok(MOCK_RESPONSE.to_string()),
        other => bail!("Unknown llm provider: {}", other),
    }
}

async fn generate_openai(config: &LlmConfig, prompt: &str) -> Result<String> {
    let api_key =
        std::env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("OPENAI_API_KEY not set"))?;
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("llm.model required for openai provider"))?;
    let url = config
        .url
        .as_deref()
        .unwrap_or("https://api.openai.com/v1/chat/completions");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let request = ChatRequest {
        model,
        messages: vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }],
        temperature: Some(0.2),
    };

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let parsed: ChatResponse = response.json().await?;
                    return parsed
                        .choices
                        .into_iter()
                        .next()
                        .map(|c| c.message.content)
                        .ok_or_else(|| anyhow::anyhow!("LLM returned no choices"));
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("LLM API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("LLM API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(e.into());
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("LLM generation failed after retries")))
}

async fn generate_ollama(config: &LlmConfig, prompt: &str) -> Result<String> {
    let model = config
        .model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("llm.model required for ollama provider"))?;
    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()?;

    let body = serde_json::json!({
        "model": model,
        "prompt": prompt,
        "stream": false,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/api/generate", url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response.json().await?;
                    return json
                        .get("response")
                        .and_then(|r| r.as_str())
                        .map(|s| s.to_string())
                        .ok_or_else(|| {
                            anyhow::anyhow!("Invalid Ollama response: missing response field")
                        });
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(anyhow::anyhow!("Ollama API error {}: {}", status, body_text));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                bail!("Ollama API error {}: {}", status, body_text);
            }
            Err(e) => {
                last_err = Some(anyhow::anyhow!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    url,
                    e
                ));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Ollama generation failed after retries")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LlmConfig;

    #[tokio::test]
    async fn test_mock_provider_returns_parseable_json() {
        let config = LlmConfig::default();
        assert_eq!(config.provider, "mock");
        let out = generate(&config, "anything").await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(value.get("rootCause").is_some());
        assert!(value.get("failureStage").is_some());
        assert!(value.get("suggestedFix").is_some());
    }

    #[tokio::test]
    async fn test_unknown_provider_errors() {
        let config = LlmConfig {
            provider: "carrier-pigeon".to_string(),
            ..LlmConfig::default()
        };
        assert!(generate(&config, "x").await.is_err());
    }
}
