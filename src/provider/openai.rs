//! OpenAI-compatible chat and embeddings over HTTP.
//!
//! Works against any endpoint speaking `/v1/chat/completions` and
//! `/v1/embeddings`. Calls carry a per-call deadline and transient failures
//! are retried with bounded backoff.

use std::time::Duration;

use serde::Deserialize;

use super::{ChatProvider, EmbeddingProvider, RetryPolicy, with_deadline};
use crate::error::{GraphRagError, Result};
use crate::tokens::ModelFamily;

/// Connection settings shared by the chat and embedding clients.
#[derive(Debug, Clone)]
pub struct OpenAiSettings {
    /// Base URL without trailing slash (e.g. `https://api.openai.com`).
    pub base_url: String,
    /// Optional bearer token.
    pub api_key: Option<String>,
    /// Chat model identifier.
    pub model: String,
    /// Embedding model identifier.
    pub embed_model: String,
    /// Per-call deadline.
    pub deadline: Duration,
    /// Token-ratio family of the chat model.
    pub family: ModelFamily,
}

impl Default for OpenAiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            embed_model: "text-embedding-3-small".to_string(),
            deadline: Duration::from_secs(30),
            family: ModelFamily::GptLike,
        }
    }
}

// =============================================================================
// Chat
// =============================================================================

/// Chat client for OpenAI-compatible `/v1/chat/completions`.
#[derive(Clone)]
pub struct OpenAiChatProvider {
    http: reqwest::Client,
    settings: OpenAiSettings,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAiChatProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiChatProvider")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.model)
            .finish()
    }
}

impl OpenAiChatProvider {
    #[must_use]
    pub fn new(settings: OpenAiSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            retry: RetryPolicy::default(),
        }
    }

    fn chat_url(&self) -> String {
        format!(
            "{}/v1/chat/completions",
            self.settings.base_url.trim_end_matches('/')
        )
    }

    async fn ask_once(&self, prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.settings.model,
            "messages": [{"role": "user", "content": prompt}],
        });

        let mut rb = self.http.post(self.chat_url()).json(&body);
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }

        let resp = rb.send().await?.error_for_status()?;
        let parsed: ChatResponse = resp.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GraphRagError::ProviderUnavailable("empty choices array".into()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

#[async_trait::async_trait]
impl ChatProvider for OpenAiChatProvider {
    async fn ask(&self, prompt: &str) -> Result<String> {
        let deadline = self.settings.deadline;
        self.retry
            .run(|| with_deadline(deadline, self.ask_once(prompt)))
            .await
    }

    fn family(&self) -> ModelFamily {
        self.settings.family
    }
}

// =============================================================================
// Embeddings
// =============================================================================

/// Embedding client for OpenAI-compatible `/v1/embeddings`.
#[derive(Clone)]
pub struct OpenAiEmbeddingProvider {
    http: reqwest::Client,
    settings: OpenAiSettings,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAiEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiEmbeddingProvider")
            .field("base_url", &self.settings.base_url)
            .field("model", &self.settings.embed_model)
            .finish()
    }
}

impl OpenAiEmbeddingProvider {
    #[must_use]
    pub fn new(settings: OpenAiSettings) -> Self {
        Self {
            http: reqwest::Client::new(),
            settings,
            retry: RetryPolicy::default(),
        }
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!(
            "{}/v1/embeddings",
            self.settings.base_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "model": self.settings.embed_model,
            "input": texts,
        });

        let mut rb = self.http.post(url).json(&body);
        if let Some(key) = &self.settings.api_key {
            rb = rb.bearer_auth(key);
        }

        let resp = rb.send().await?.error_for_status()?;
        let parsed: EmbeddingResponse = resp.json().await?;

        let mut rows = parsed.data;
        // The API is allowed to reorder; indexes restore input order.
        rows.sort_by_key(|d| d.index);
        Ok(rows.into_iter().map(|d| d.embedding).collect())
    }
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let batch = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        batch
            .into_iter()
            .next()
            .ok_or_else(|| GraphRagError::ProviderUnavailable("empty embedding response".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let deadline = self.settings.deadline;
        self.retry
            .run(|| with_deadline(deadline, self.embed_once(texts)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_url_trims_trailing_slash() {
        let provider = OpenAiChatProvider::new(OpenAiSettings {
            base_url: "https://api.openai.com/".to_string(),
            ..OpenAiSettings::default()
        });
        assert_eq!(provider.chat_url(), "https://api.openai.com/v1/chat/completions");
    }

    #[test]
    fn test_embedding_rows_restore_order() {
        let resp: EmbeddingResponse = serde_json::from_str(
            r#"{"data": [
                {"index": 1, "embedding": [2.0]},
                {"index": 0, "embedding": [1.0]}
            ]}"#,
        )
        .unwrap();
        let mut rows = resp.data;
        rows.sort_by_key(|d| d.index);
        assert_eq!(rows[0].embedding, vec![1.0]);
    }
}
