//! Embedding provider abstraction and the OpenAI implementation.
//!
//! The store talks to embeddings only through the [`Embedder`] trait, so
//! tests can substitute a deterministic provider. The production
//! implementation calls the OpenAI embeddings API with exponential
//! backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::warn;

use crate::config::EmbeddingConfig;

/// Character budget for a single embedding request.
///
/// The provider enforces a token limit (8191 for text-embedding-3-small);
/// ~6000 tokens at roughly four characters per token leaves a comfortable
/// margin without a tokenizer dependency.
const SAFE_CHAR_BUDGET: usize = 24_000;

/// A provider of fixed-length embedding vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed a single text. Implementations with a request size limit
    /// truncate oversized input via [`truncate_for_embedding`] rather
    /// than erroring.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Truncate text to the safe request budget, on a char boundary.
///
/// Truncation is lossy and logged, never an error.
pub fn truncate_for_embedding(text: &str) -> &str {
    if text.len() <= SAFE_CHAR_BUDGET {
        return text;
    }
    let mut end = SAFE_CHAR_BUDGET;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        original_chars = text.len(),
        truncated_chars = end,
        "text truncated before embedding"
    );
    &text[..end]
}

/// Embedding provider using the OpenAI API.
///
/// Calls `POST /v1/embeddings` with the configured model. Requires the
/// `OPENAI_API_KEY` environment variable at construction time.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    max_retries: u32,
}

impl OpenAiEmbedder {
    pub fn new(config: &EmbeddingConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let safe_text = truncate_for_embedding(text);

        let body = serde_json::json!({
            "model": self.model,
            "input": safe_text,
        });

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: serde_json::Value = response.json().await?;
                        return parse_embedding_response(&json);
                    }

                    // Rate limited or server error — retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err =
                            Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    // Client error (not 429) — don't retry
                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Embedding failed after retries")))
    }
}

/// Extract the first `data[].embedding` array from the API response.
fn parse_embedding_response(json: &serde_json::Value) -> Result<Vec<f32>> {
    let embedding = json
        .get("data")
        .and_then(|d| d.as_array())
        .and_then(|d| d.first())
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}
