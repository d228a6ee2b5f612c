//! Local embeddings via fastembed.
//!
//! The fastembed model is blocking and not cheaply clonable, so it lives
//! behind a mutex and is moved into `spawn_blocking` for each batch (take,
//! embed, put back). This keeps the async runtime free while a batch runs.

use std::sync::Arc;

use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use tokio::sync::Mutex;
use tracing::info;

use super::EmbeddingProvider;
use crate::error::{GraphRagError, Result};

/// Embedding provider backed by a local fastembed model.
pub struct LocalEmbeddingProvider {
    model: Arc<Mutex<Option<TextEmbedding>>>,
    dimensions: usize,
}

impl std::fmt::Debug for LocalEmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEmbeddingProvider")
            .field("dimensions", &self.dimensions)
            .finish()
    }
}

impl LocalEmbeddingProvider {
    /// Load the default model (BGE small EN, 384 dimensions).
    ///
    /// Downloads model files on first use; call once at startup.
    pub async fn init() -> Result<Self> {
        info!("initializing fastembed model (BGE-Small-En-V1.5)");
        let model = tokio::task::spawn_blocking(|| {
            TextEmbedding::try_new(InitOptions::new(EmbeddingModel::BGESmallENV15))
        })
        .await
        .map_err(|e| GraphRagError::ProviderUnavailable(e.to_string()))?
        .map_err(|e| GraphRagError::ProviderUnavailable(e.to_string()))?;

        Ok(Self {
            model: Arc::new(Mutex::new(Some(model))),
            dimensions: 384,
        })
    }

    async fn run_batch(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let mut guard = self.model.lock().await;
        let mut owned = guard
            .take()
            .ok_or_else(|| GraphRagError::ProviderUnavailable("embedding model not loaded".into()))?;

        let (result, returned) = tokio::task::spawn_blocking(move || {
            let out = owned.embed(texts, None);
            (out, owned)
        })
        .await
        .map_err(|e| GraphRagError::ProviderUnavailable(e.to_string()))?;

        *guard = Some(returned);
        result.map_err(|e| GraphRagError::ProviderUnavailable(e.to_string()))
    }
}

#[async_trait::async_trait]
impl EmbeddingProvider for LocalEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut out = self.run_batch(vec![text.to_string()]).await?;
        out.pop()
            .ok_or_else(|| GraphRagError::ProviderUnavailable("empty embedding batch".into()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run_batch(texts.to_vec()).await
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }
}
