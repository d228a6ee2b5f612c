//! Scripted providers for tests and offline development.
//!
//! `MockChat` matches substrings of the incoming prompt against registered
//! rules and replays canned responses; `MockEmbedder` derives a deterministic
//! vector from the text so similarity is reproducible without a model.

use std::sync::Mutex;

use super::{ChatProvider, EmbeddingProvider};
use crate::error::{GraphRagError, Result};

// =============================================================================
// MockChat
// =============================================================================

/// Chat provider replaying canned responses.
#[derive(Debug, Default)]
pub struct MockChat {
    rules: Vec<(String, String)>,
    fail_markers: Vec<String>,
    fallback: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl MockChat {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `response` whenever the prompt contains `marker`.
    /// Rules are checked in registration order.
    #[must_use]
    pub fn on(mut self, marker: &str, response: &str) -> Self {
        self.rules.push((marker.to_string(), response.to_string()));
        self
    }

    /// Fail with `ProviderUnavailable` whenever the prompt contains `marker`.
    #[must_use]
    pub fn fail_on(mut self, marker: &str) -> Self {
        self.fail_markers.push(marker.to_string());
        self
    }

    /// Response used when no rule matches.
    #[must_use]
    pub fn fallback(mut self, response: &str) -> Self {
        self.fallback = Some(response.to_string());
        self
    }

    /// Prompts received so far.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("mock lock poisoned").clone()
    }
}

#[async_trait::async_trait]
impl ChatProvider for MockChat {
    async fn ask(&self, prompt: &str) -> Result<String> {
        self.calls
            .lock()
            .expect("mock lock poisoned")
            .push(prompt.to_string());

        if self.fail_markers.iter().any(|m| prompt.contains(m)) {
            return Err(GraphRagError::ProviderUnavailable("scripted failure".into()));
        }
        if let Some((_, response)) = self.rules.iter().find(|(m, _)| prompt.contains(m)) {
            return Ok(response.clone());
        }
        self.fallback
            .clone()
            .ok_or_else(|| GraphRagError::ProviderUnavailable("no scripted response".into()))
    }
}

// =============================================================================
// MockEmbedder
// =============================================================================

/// Deterministic hashing embedder.
#[derive(Debug, Clone, Copy)]
pub struct MockEmbedder {
    dim: usize,
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self { dim: 8 }
    }
}

impl MockEmbedder {
    #[must_use]
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dim];
        // Bucket word hashes so shared words produce similar vectors.
        for word in text.to_lowercase().split_whitespace() {
            let mut h = 0usize;
            for b in word.bytes() {
                h = h.wrapping_mul(31).wrapping_add(b as usize);
            }
            v[h % self.dim] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for MockEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dim)
    }
}
