//! Provider capability traits and implementations.
//!
//! The core consumes two narrow capabilities: chat text generation and text
//! embedding. Both are modeled as traits so engines receive handles by
//! injection; there are no process-wide provider singletons.

pub mod json;
pub mod local;
pub mod mock;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{GraphRagError, Result};
use crate::tokens::ModelFamily;

// =============================================================================
// Capability traits
// =============================================================================

/// Chat text generation.
#[async_trait]
pub trait ChatProvider: Send + Sync + std::fmt::Debug {
    /// Send a prompt, get the model's text back.
    async fn ask(&self, prompt: &str) -> Result<String>;

    /// Provider family, used by the token budgeter.
    fn family(&self) -> ModelFamily {
        ModelFamily::Other
    }
}

/// Text embedding.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync + std::fmt::Debug {
    /// Embed one text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts; output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Output dimensionality, when the provider knows it up front. Indexes
    /// fix their dimension at first write either way.
    fn dimensions(&self) -> Option<usize> {
        None
    }
}

// =============================================================================
// Retry policy
// =============================================================================

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// Run `op` with retries; only `ProviderUnavailable` and
    /// `StorageUnavailable` are retried, everything else surfaces directly.
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(err) if attempt < self.max_retries && is_transient(&err) => {
                    let delay = self.base_delay * 2u32.pow(attempt);
                    tracing::warn!(attempt, error = %err, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn is_transient(err: &GraphRagError) -> bool {
    matches!(
        err,
        GraphRagError::ProviderUnavailable(_) | GraphRagError::StorageUnavailable(_)
    )
}

/// Apply a per-call deadline to a provider future.
pub async fn with_deadline<T, Fut>(deadline: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(GraphRagError::ProviderUnavailable(format!(
            "call exceeded {}s deadline",
            deadline.as_secs()
        ))),
    }
}
