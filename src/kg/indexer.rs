//! Vector index maintenance.
//!
//! Encodes entity texts (description, falling back to name) and community
//! summaries, writing the vectors back through the store. Index names are
//! stable functions of the series; the dimension is fixed at first write.
//! The chunk index is owned by the upstream embedding collaborator and only
//! referenced here by name.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::Result;
use crate::provider::EmbeddingProvider;
use crate::store::{GraphStore, IndexKind, index_name};

/// Indexer settings.
#[derive(Debug, Clone, Copy)]
pub struct IndexerConfig {
    /// Texts per embedding batch.
    pub batch: usize,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self { batch: 256 }
    }
}

/// Result of an index sync.
#[derive(Debug, Default)]
pub struct IndexOutcome {
    /// Logical index names maintained or referenced for the series.
    pub indexes: Vec<String>,
    pub warnings: Vec<String>,
}

/// Maintains the per-series entity and community vector indexes.
pub struct SearchIndexer {
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    config: IndexerConfig,
}

impl std::fmt::Debug for SearchIndexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndexer")
            .field("embedder", &self.embedder.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl SearchIndexer {
    #[must_use]
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, config: IndexerConfig) -> Self {
        Self { embedder, config }
    }

    /// (Re)encode entity and summary texts for the series.
    pub async fn sync(&self, store: &dyn GraphStore, series: &str) -> Result<IndexOutcome> {
        let mut outcome = IndexOutcome {
            indexes: vec![
                index_name(IndexKind::Entity, series),
                index_name(IndexKind::Community, series),
                index_name(IndexKind::Chunk, series),
            ],
            warnings: Vec::new(),
        };

        let Some(embedder) = &self.embedder else {
            warn!(series, "no embedding provider, index sync skipped");
            outcome
                .warnings
                .push("index_sync: embeddings unavailable, vectors not written".to_string());
            return Ok(outcome);
        };

        // Entities: desc falling back to name, id-ordered from the store.
        let (entities, _) = store.load_graph(series).await?;
        let entity_items: Vec<(String, String)> = entities
            .iter()
            .map(|e| {
                let text = if e.desc.trim().is_empty() { e.name.clone() } else { e.desc.clone() };
                (e.id.clone(), text)
            })
            .collect();
        let written = self
            .encode(store, series, IndexKind::Entity, &entity_items, embedder.as_ref())
            .await?;
        info!(series, entities = written, "entity index synced");

        // Community summaries.
        let summaries = store.summaries(series, None).await?;
        let summary_items: Vec<(String, String)> = summaries
            .iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| (s.id.clone(), s.text.clone()))
            .collect();
        let written = self
            .encode(store, series, IndexKind::Community, &summary_items, embedder.as_ref())
            .await?;
        info!(series, summaries = written, "community index synced");

        Ok(outcome)
    }

    /// Batch-encode `items` and write the vectors for `kind`.
    async fn encode(
        &self,
        store: &dyn GraphStore,
        series: &str,
        kind: IndexKind,
        items: &[(String, String)],
        embedder: &dyn EmbeddingProvider,
    ) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }

        let mut written = 0;
        let mut registered_dim: Option<usize> = None;
        let mut buffer: Vec<(String, Vec<f32>)> = Vec::new();

        for batch in items.chunks(self.config.batch.max(1)) {
            let texts: Vec<String> = batch.iter().map(|(_, t)| t.clone()).collect();
            let vectors = embedder.embed_batch(&texts).await?;

            for ((id, _), vector) in batch.iter().zip(vectors) {
                if registered_dim.is_none() {
                    let dim = store.register_index(kind, series, vector.len()).await?;
                    if dim != vector.len() {
                        return Err(crate::error::GraphRagError::ConfigInvalid(format!(
                            "index {} is fixed at dimension {dim}, provider returned {}",
                            index_name(kind, series),
                            vector.len()
                        )));
                    }
                    registered_dim = Some(dim);
                }
                buffer.push((id.clone(), vector));
            }

            if buffer.len() >= 1000 {
                written += self.flush(store, series, kind, &mut buffer).await?;
            }
        }
        written += self.flush(store, series, kind, &mut buffer).await?;
        Ok(written)
    }

    async fn flush(
        &self,
        store: &dyn GraphStore,
        series: &str,
        kind: IndexKind,
        buffer: &mut Vec<(String, Vec<f32>)>,
    ) -> Result<u64> {
        if buffer.is_empty() {
            return Ok(0);
        }
        let rows = std::mem::take(buffer);
        match kind {
            IndexKind::Entity => store.write_entity_vectors(series, &rows).await,
            IndexKind::Community => store.write_summary_vectors(series, &rows).await,
            IndexKind::Chunk => Ok(0),
        }
    }
}
